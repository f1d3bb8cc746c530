use log::{info, warn};

use crate::{
    config::KettleConfig,
    state::{DeviceState, Rgb, TemperatureReading},
};

/// A single pin-level operation for the actuator driver. The engine only
/// emits these; the firmware shell owns the GPIO/PWM handles and applies
/// each batch inside the critical section that produced it, so the pins
/// always change in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinAction {
    /// `true` energizes the relay, which disables the heating element.
    SetRelay(bool),
    SetLed(bool),
    SetColor(Rgb),
}

/// The shared control core for the heater, LED, indicator color, and
/// temperature readings. All mutation goes through here so the relay/LED
/// pair changes as one logical field.
#[derive(Debug, Clone)]
pub struct KettleEngine {
    state: DeviceState,
}

impl KettleEngine {
    pub fn new(mut config: KettleConfig) -> Self {
        config.sanitize();
        Self {
            state: DeviceState::new(config.target_temp_c, config.idle_color),
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn current_temperature(&self) -> TemperatureReading {
        self.state.current_temperature
    }

    pub fn target_temperature(&self) -> f32 {
        self.state.target_temperature
    }

    pub fn heater_enabled(&self) -> bool {
        self.state.heater_enabled()
    }

    /// Pin writes that bring the hardware in line with the boot state:
    /// relay energized (heater off), LED dark, idle indicator color.
    pub fn startup_actions(&self) -> Vec<PinAction> {
        vec![
            PinAction::SetRelay(self.state.relay_engaged),
            PinAction::SetLed(self.state.led_indicator),
            PinAction::SetColor(self.state.indicator_color),
        ]
    }

    /// Switches the heater and its indicator LED together. Repeating the
    /// current state is a no-op that emits no pin writes.
    pub fn set_heater(&mut self, enabled: bool) -> Vec<PinAction> {
        if self.state.heater_enabled() == enabled {
            return Vec::new();
        }

        self.state.relay_engaged = !enabled;
        self.state.led_indicator = enabled;
        vec![
            PinAction::SetRelay(self.state.relay_engaged),
            PinAction::SetLed(self.state.led_indicator),
        ]
    }

    pub fn set_color(&mut self, color: Rgb) -> Vec<PinAction> {
        self.state.indicator_color = color;
        vec![PinAction::SetColor(color)]
    }

    /// Feeds one sampling cycle into the core. A successful reading updates
    /// the shared temperature and evaluates the shutoff interlock; a failed
    /// one marks the reading unknown and makes no interlock decision at all.
    pub fn record_sample(&mut self, reading: Option<f32>) -> Vec<PinAction> {
        let Some(celsius) = reading else {
            warn!("temperature read failed, marking reading unknown");
            self.state.current_temperature = TemperatureReading::Unknown;
            return Vec::new();
        };

        self.state.current_temperature = TemperatureReading::Known(celsius);
        self.evaluate_interlock(celsius)
    }

    fn evaluate_interlock(&mut self, celsius: f32) -> Vec<PinAction> {
        if celsius < self.state.target_temperature || !self.state.heater_enabled() {
            return Vec::new();
        }

        info!(
            "target temperature {:.1}C reached ({:.1}C), shutting kettle off",
            self.state.target_temperature, celsius
        );
        self.set_heater(false)
    }
}
