use std::{io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::any,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use kettle_common::{
    ConnectionId, ControlServer, DeviceProfile, PinAction, ResponseSink, Rgb, RuntimeConfig,
};

#[derive(Clone)]
struct AppState {
    server: Arc<Mutex<ControlServer<OutboundSink>>>,
    pins: Arc<Mutex<SimulatedPins>>,
    settle: Duration,
}

/// Enqueue-only outbound path for one connection. The socket writer task
/// drains the channel; a failed send just means the client went away.
#[derive(Debug, Clone)]
struct OutboundSink(mpsc::UnboundedSender<String>);

impl ResponseSink for OutboundSink {
    fn deliver(&self, payload: String) {
        let _ = self.0.send(payload);
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}; using defaults");
        RuntimeConfig::default()
    });
    config.kettle.sanitize();

    let profile = match std::env::var("KETTLE_PROFILE").as_deref() {
        Ok("minimal") => DeviceProfile::Minimal,
        _ => DeviceProfile::Kettle,
    };
    info!("starting with profile {profile:?}");

    let app_state = AppState {
        server: Arc::new(Mutex::new(ControlServer::new(config.kettle.clone(), profile))),
        pins: Arc::new(Mutex::new(SimulatedPins::default())),
        settle: Duration::from_millis(config.kettle.sample_settle_ms),
    };

    {
        let server = app_state.server.lock().await;
        apply_pin_actions(&app_state.pins, server.startup_actions()).await;
    }

    if profile.has_sensor() {
        spawn_monitor_loop(app_state.clone());
    }

    let app = Router::new()
        .route("/ws", any(handle_upgrade))
        .with_state(app_state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.network.listen_port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control server at {addr}"))?;

    info!("kettle control server listening on ws://{addr}/ws");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let data_dir = std::env::var("KETTLE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.kettle"));
    let path = data_dir.join("runtime.json");

    match std::fs::read(&path) {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

async fn handle_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (mut writer, mut reader) = socket.split();
    let (outbound, mut inbox) = mpsc::unbounded_channel::<String>();

    let id = {
        let mut server = state.server.lock().await;
        server.register(addr.ip().to_string(), OutboundSink(outbound))
    };

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = inbox.recv().await {
            if writer.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = reader.next().await {
        match frame {
            Message::Text(raw) => {
                process_text(&state, id, raw.as_str()).await;
            }
            Message::Binary(_) => {
                let mut server = state.server.lock().await;
                server.handle_binary(id);
            }
            Message::Close(_) => break,
            // axum answers pings on its own.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    {
        let mut server = state.server.lock().await;
        server.unregister(id);
    }
    writer_task.abort();
}

/// Runs one inbound text frame against the control core. The pin writes
/// happen while the state lock is still held, so the pins always change in
/// the order the state changes committed.
async fn process_text(state: &AppState, id: ConnectionId, raw: &str) {
    let mut server = state.server.lock().await;
    let actions = server.handle_message(id, raw);
    apply_pin_actions(&state.pins, actions).await;
}

async fn process_sample(state: &AppState, reading: Option<f32>) {
    let mut server = state.server.lock().await;
    let actions = server.ingest_sample(reading);
    apply_pin_actions(&state.pins, actions).await;
}

fn spawn_monitor_loop(state: AppState) {
    tokio::spawn(async move {
        let mut probe = SimulatedProbe::new(21.0);
        loop {
            // Conversion settle wait; the state lock is not held here.
            tokio::time::sleep(state.settle).await;

            let heater_on = { state.server.lock().await.engine().heater_enabled() };
            let reading = probe.read(heater_on);

            process_sample(&state, reading).await;
        }
    });
}

// Callers invoke this inside the server critical section; the pins lock is
// only ever taken with the server lock already held.
async fn apply_pin_actions(pins: &Arc<Mutex<SimulatedPins>>, actions: Vec<PinAction>) {
    if actions.is_empty() {
        return;
    }
    let mut pins = pins.lock().await;
    for action in actions {
        pins.apply(action);
    }
}

/// Stand-in for the relay/LED/PWM bank; the ESP32 build drives real pins
/// through the same action seam.
#[derive(Debug, Default)]
struct SimulatedPins {
    relay_engaged: bool,
    led: bool,
    color: Option<Rgb>,
}

impl SimulatedPins {
    fn apply(&mut self, action: PinAction) {
        info!("pin action: {action:?}");
        match action {
            PinAction::SetRelay(engaged) => self.relay_engaged = engaged,
            PinAction::SetLed(lit) => self.led = lit,
            PinAction::SetColor(color) => self.color = Some(color),
        }
    }
}

/// Simulated DS18B20: ramps toward boiling while the heater runs and sinks
/// back toward ambient otherwise, so the shutoff interlock can be exercised
/// end to end without hardware.
#[derive(Debug)]
struct SimulatedProbe {
    ambient: f32,
    current: f32,
}

impl SimulatedProbe {
    fn new(ambient: f32) -> Self {
        Self {
            ambient,
            current: ambient,
        }
    }

    fn read(&mut self, heater_on: bool) -> Option<f32> {
        if heater_on {
            self.current = (self.current + 0.8).min(100.0);
        } else {
            self.current = (self.current - 0.3).max(self.ambient);
        }
        Some(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kettle_common::KettleConfig;

    fn test_state() -> AppState {
        AppState {
            server: Arc::new(Mutex::new(ControlServer::new(
                KettleConfig::default(),
                DeviceProfile::Kettle,
            ))),
            pins: Arc::new(Mutex::new(SimulatedPins::default())),
            settle: Duration::from_millis(750),
        }
    }

    async fn connect(state: &AppState) -> ConnectionId {
        let (outbound, _inbox) = mpsc::unbounded_channel();
        state
            .server
            .lock()
            .await
            .register("127.0.0.1".to_string(), OutboundSink(outbound))
    }

    #[tokio::test]
    async fn shutoff_reaches_the_pins_after_the_command_that_preceded_it() {
        let state = test_state();
        let id = connect(&state).await;

        process_text(&state, id, r#"{"command":"kettleOn"}"#).await;
        process_sample(&state, Some(60.0)).await;

        let server = state.server.lock().await;
        let pins = state.pins.lock().await;
        assert!(!server.engine().heater_enabled());
        assert!(pins.relay_engaged);
        assert!(!pins.led);
    }

    #[tokio::test]
    async fn pins_match_committed_state_when_commands_race_the_monitor() {
        let state = test_state();
        let id = connect(&state).await;

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let command_state = state.clone();
            tasks.push(tokio::spawn(async move {
                process_text(&command_state, id, r#"{"command":"kettleOn"}"#).await;
            }));
            let sample_state = state.clone();
            tasks.push(tokio::spawn(async move {
                process_sample(&sample_state, Some(95.0)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let server = state.server.lock().await;
        let pins = state.pins.lock().await;
        let device = server.engine().state();
        assert_eq!(pins.relay_engaged, device.relay_engaged);
        assert_eq!(pins.led, device.led_indicator);
    }
}
