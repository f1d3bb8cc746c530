use serde::{Deserialize, Serialize, Serializer};

/// Last sampled temperature. `Unknown` is an explicit sentinel set whenever
/// the most recent read failed; it is never conflated with a stale number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemperatureReading {
    Known(f32),
    Unknown,
}

impl TemperatureReading {
    pub fn as_celsius(self) -> Option<f32> {
        match self {
            Self::Known(celsius) => Some(celsius),
            Self::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl Serialize for TemperatureReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(celsius) => serializer.serialize_f32(*celsius),
            Self::Unknown => serializer.serialize_none(),
        }
    }
}

/// An RGB duty triple for the indicator light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// The single shared record of actuator and sensor status.
///
/// The relay is wired normally-energized-off: `relay_engaged == true` means
/// the heating element is disabled. The LED mirrors the logical heater state,
/// so `led_indicator == !relay_engaged` must hold whenever a handler or the
/// interlock has completed; the pair only changes together.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub relay_engaged: bool,
    pub led_indicator: bool,
    pub current_temperature: TemperatureReading,
    pub target_temperature: f32,
    pub indicator_color: Rgb,
}

impl DeviceState {
    /// Boot state: relay energized (heater off), LED dark, no reading yet.
    pub fn new(target_temperature: f32, idle_color: Rgb) -> Self {
        Self {
            relay_engaged: true,
            led_indicator: false,
            current_temperature: TemperatureReading::Unknown,
            target_temperature,
            indicator_color: idle_color,
        }
    }

    pub fn heater_enabled(&self) -> bool {
        !self.relay_engaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn boot_state_has_heater_off_and_led_dark() {
        let state = DeviceState::new(60.0, Rgb::new(0, 0, 32));

        assert!(state.relay_engaged);
        assert!(!state.led_indicator);
        assert!(!state.heater_enabled());
        assert_eq!(state.current_temperature, TemperatureReading::Unknown);
    }

    #[test]
    fn unknown_reading_serializes_to_null() {
        let raw = serde_json::to_string(&TemperatureReading::Unknown).unwrap();
        assert_eq!(raw, "null");

        let raw = serde_json::to_string(&TemperatureReading::Known(21.5)).unwrap();
        assert_eq!(raw, "21.5");
    }
}
