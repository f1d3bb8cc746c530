use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, Output, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpServer,
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
    ws::FrameType,
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use kettle_common::{
    config::NetworkConfig, ConnectionId, ControlServer, DeviceProfile, PinAction, ResponseSink,
    Rgb, RuntimeConfig,
};

const NVS_NAMESPACE: &str = "kettle";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_CONFIG_LEN: usize = 1024;

// Wire protocol caps inbound frames at 256 bytes.
const MAX_WS_FRAME: usize = 256;

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type SharedServer = Arc<Mutex<ControlServer<WsSink>>>;
type SharedActuators = Arc<Mutex<Actuators>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.kettle.sanitize();
    ensure_wifi_defaults(&mut runtime);

    let profile = match option_env!("KETTLE_PROFILE") {
        Some("minimal") => DeviceProfile::Minimal,
        _ => DeviceProfile::Kettle,
    };
    info!("starting with profile {profile:?}");

    let Peripherals { modem, pins, ledc, .. } = Peripherals::take()?;

    let rgb = if profile.has_sensor() {
        // The device runs until power loss; leaking the timer gives the
        // channels the 'static lifetime they need.
        let timer: &'static LedcTimerDriver<'static> = Box::leak(Box::new(LedcTimerDriver::new(
            ledc.timer0,
            &TimerConfig::default().frequency(1.kHz().into()),
        )?));
        Some(RgbChannels {
            red: LedcDriver::new(ledc.channel0, timer, pins.gpio25)?,
            green: LedcDriver::new(ledc.channel1, timer, pins.gpio26)?,
            blue: LedcDriver::new(ledc.channel2, timer, pins.gpio27)?,
        })
    } else {
        None
    };

    let actuators: SharedActuators = Arc::new(Mutex::new(Actuators {
        relay: PinDriver::output(pins.gpio13.downgrade())?,
        led: PinDriver::output(pins.gpio2.downgrade())?,
        rgb,
    }));

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let server: SharedServer = Arc::new(Mutex::new(ControlServer::new(
        runtime.kettle.clone(),
        profile,
    )));

    {
        let server = server.lock().unwrap();
        apply_pin_actions(&actuators, server.startup_actions());
    }

    if profile.has_sensor() {
        let probe = TemperatureProbe::new(pins.gpio5.downgrade())
            .context("failed to initialize DS18B20 probe")?;
        spawn_monitor_loop(server.clone(), actuators.clone(), probe);
    }

    let http = create_ws_server(server, actuators, runtime.network.listen_port)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _http = http;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }
    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buf = vec![0_u8; MAX_CONFIG_LEN];
    match nvs.get_str(NVS_RUNTIME_KEY, &mut buf)? {
        Some(raw) => Ok(serde_json::from_str(raw.trim_end_matches('\0'))?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(err).context("all wifi connect attempts failed");
    }
    Ok(esp_wifi)
}

/// Response path for one WebSocket session. The detached sender hands the
/// frame to httpd's send queue, so delivery is scheduled, not awaited.
struct WsSink {
    sender: Mutex<EspHttpWsDetachedSender>,
}

impl WsSink {
    fn new(sender: EspHttpWsDetachedSender) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ResponseSink for WsSink {
    fn deliver(&self, payload: String) {
        let mut sender = match self.sender.lock() {
            Ok(sender) => sender,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = sender.send(FrameType::Text(false), payload.as_bytes()) {
            warn!("response send failed: {err}");
        }
    }
}

fn create_ws_server(
    server: SharedServer,
    actuators: SharedActuators,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        ..Default::default()
    };
    let mut http = EspHttpServer::new(&conf)?;
    let sessions: Arc<Mutex<HashMap<i32, ConnectionId>>> = Arc::new(Mutex::new(HashMap::new()));

    http.ws_handler("/ws", move |ws: &mut EspHttpWsConnection| -> anyhow::Result<()> {
        if ws.is_new() {
            let sender = ws.create_detached_sender()?;
            let id = {
                let mut server = server.lock().unwrap();
                server.register(format!("session-{}", ws.session()), WsSink::new(sender))
            };
            let _ = sessions.lock().unwrap().insert(ws.session(), id);
            return Ok(());
        }
        if ws.is_closed() {
            if let Some(id) = sessions.lock().unwrap().remove(&ws.session()) {
                server.lock().unwrap().unregister(id);
            }
            return Ok(());
        }

        let Some(id) = sessions.lock().unwrap().get(&ws.session()).copied() else {
            return Ok(());
        };

        let (frame_type, len) = ws.recv(&mut [])?;
        if len > MAX_WS_FRAME {
            warn!("dropping oversized frame ({len} bytes) from session {}", ws.session());
            return Ok(());
        }

        let mut buf = vec![0_u8; len];
        let _ = ws.recv(buf.as_mut_slice())?;

        match frame_type {
            FrameType::Text(_) => {
                let Ok(raw) = core::str::from_utf8(&buf[..len]) else {
                    warn!("dropping non-utf8 text frame from session {}", ws.session());
                    return Ok(());
                };
                // Pins are written before the state lock drops, so they
                // always change in the order the state changes committed.
                let mut server = server.lock().unwrap();
                let actions = server.handle_message(id, raw.trim_end_matches('\0'));
                apply_pin_actions(&actuators, actions);
            }
            FrameType::Binary(_) => {
                server.lock().unwrap().handle_binary(id);
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(http)
}

fn spawn_monitor_loop(server: SharedServer, actuators: SharedActuators, mut probe: TemperatureProbe) {
    thread::Builder::new()
        .name("temp-monitor".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            // The conversion settle happens inside the probe read; no lock
            // is held until the reading is in hand.
            let reading = probe.read_celsius();

            {
                let mut server = server.lock().unwrap();
                let actions = server.ingest_sample(reading);
                apply_pin_actions(&actuators, actions);
            }

            thread::sleep(Duration::from_millis(250));
        })
        .expect("failed to spawn temperature monitor thread");
}

// Callers invoke this inside the server critical section; the actuator lock
// is only ever taken with the server lock already held.
fn apply_pin_actions(actuators: &SharedActuators, actions: Vec<PinAction>) {
    if actions.is_empty() {
        return;
    }
    let mut actuators = actuators.lock().unwrap();
    for action in actions {
        if let Err(err) = actuators.apply(action) {
            warn!("pin action {action:?} failed: {err:#}");
        }
    }
}

struct RgbChannels {
    red: LedcDriver<'static>,
    green: LedcDriver<'static>,
    blue: LedcDriver<'static>,
}

impl RgbChannels {
    fn set(&mut self, color: Rgb) -> anyhow::Result<()> {
        set_channel(&mut self.red, color.r)?;
        set_channel(&mut self.green, color.g)?;
        set_channel(&mut self.blue, color.b)?;
        Ok(())
    }
}

fn set_channel(channel: &mut LedcDriver<'static>, value: u8) -> anyhow::Result<()> {
    let duty = channel.get_max_duty() * u32::from(value) / 255;
    channel.set_duty(duty)?;
    Ok(())
}

struct Actuators {
    relay: PinDriver<'static, AnyIOPin, Output>,
    led: PinDriver<'static, AnyIOPin, Output>,
    rgb: Option<RgbChannels>,
}

impl Actuators {
    fn apply(&mut self, action: PinAction) -> anyhow::Result<()> {
        info!("pin action: {action:?}");
        match action {
            PinAction::SetRelay(engaged) => set_level(&mut self.relay, engaged)?,
            PinAction::SetLed(lit) => set_level(&mut self.led, lit)?,
            PinAction::SetColor(color) => {
                if let Some(rgb) = self.rgb.as_mut() {
                    rgb.set(color)?;
                }
            }
        }
        Ok(())
    }
}

fn set_level(pin: &mut PinDriver<'static, AnyIOPin, Output>, high: bool) -> anyhow::Result<()> {
    if high {
        pin.set_high()?;
    } else {
        pin.set_low()?;
    }
    Ok(())
}

/// DS18B20 on the one-wire bus. Reads block for the 12-bit conversion
/// settle time (~750 ms); a probe that drops off the bus is rediscovered
/// on the next cycle.
struct TemperatureProbe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
    address: Option<Address>,
}

impl TemperatureProbe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire =
            OneWire::new(one_wire_pin).map_err(|err| anyhow!("one-wire init failed: {err:?}"))?;
        Ok(Self {
            one_wire,
            delay: Ets,
            address: None,
        })
    }

    fn refresh_address(&mut self) {
        let mut first_probe: Option<Address> = None;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    first_probe = Some(address);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first_probe;
        match self.address {
            Some(address) => info!("DS18B20 ready ({address:?})"),
            None => warn!("no DS18B20 found on the one-wire bus"),
        }
    }

    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}
