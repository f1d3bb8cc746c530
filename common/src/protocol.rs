use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::{Rgb, TemperatureReading};

/// The one question `verify` accepts, and the secret it unlocks.
pub const VERIFY_QUESTION: &str = "Which team is the best";
pub const VERIFY_SECRET: &str = "Sprytne Dzbany";

/// Hardware profile chosen at construction. The minimal profile has no
/// temperature sensor or PWM indicator, so it carries only the base command
/// set and never runs the sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    Minimal,
    Kettle,
}

impl DeviceProfile {
    pub fn has_sensor(self) -> bool {
        matches!(self, Self::Kettle)
    }
}

/// Everything that can go wrong with a single request. All variants are
/// terminal for that request only: they map to a 400 response and never
/// touch the connection or the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Your message couldn't be parsed to json!")]
    MalformedPayload,
    #[error("There is no command specified!")]
    MissingCommand,
    #[error("There is no command named '{0}'!")]
    UnknownCommand(String),
    #[error("There is no {0} specified!")]
    MissingField(&'static str),
    #[error("Wrong question!")]
    VerificationFailed,
}

/// The closed command set. Profile extensions are merged at parse time:
/// a kettle-only command on a minimal device is an unknown command, exactly
/// as if it had never existed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    SetName { name: String },
    Verify { question: String },
    LedOn,
    LedOff,
    KettleOn,
    KettleOff,
    GetCurrentTemperature,
    SetColor { color: Rgb },
}

impl Command {
    /// The full dispatch-side contract for one raw inbound message:
    /// parse as a JSON object, extract `command`, look it up against the
    /// profile's command set, then pull the command's required fields.
    pub fn parse(profile: DeviceProfile, raw: &str) -> Result<Self, CommandError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|_| CommandError::MalformedPayload)?;
        let Value::Object(fields) = value else {
            return Err(CommandError::MalformedPayload);
        };

        // A present but non-string `command` falls through to lookup and is
        // echoed back as unknown; only an absent key is a missing command.
        let name = match fields.get("command") {
            Some(Value::String(name)) => name.as_str(),
            Some(other) => return Err(CommandError::UnknownCommand(other.to_string())),
            None => return Err(CommandError::MissingCommand),
        };

        match name {
            "ping" => Ok(Self::Ping),
            "setName" => Ok(Self::SetName {
                name: require_string(&fields, "name")?,
            }),
            "verify" => Ok(Self::Verify {
                question: require_string(&fields, "question")?,
            }),
            "ledOn" => Ok(Self::LedOn),
            "ledOff" => Ok(Self::LedOff),
            "kettleOn" if profile.has_sensor() => Ok(Self::KettleOn),
            "kettleOff" if profile.has_sensor() => Ok(Self::KettleOff),
            "getCurrentTemperature" if profile.has_sensor() => Ok(Self::GetCurrentTemperature),
            "setColor" if profile.has_sensor() => Ok(Self::SetColor {
                color: Rgb::new(
                    require_channel(&fields, "r")?,
                    require_channel(&fields, "g")?,
                    require_channel(&fields, "b")?,
                ),
            }),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

fn require_string(fields: &Map<String, Value>, key: &'static str) -> Result<String, CommandError> {
    match fields.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        _ => Err(CommandError::MissingField(key)),
    }
}

fn require_channel(fields: &Map<String, Value>, key: &'static str) -> Result<u8, CommandError> {
    fields
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|value| u8::try_from(value).ok())
        .ok_or(CommandError::MissingField(key))
}

/// One JSON object per response: a human-readable `message`, a `code`
/// (200 ok, 400 client error), plus optional domain fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureReading>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: 200,
            temperature: None,
        }
    }

    pub fn with_temperature(message: impl Into<String>, reading: TemperatureReading) -> Self {
        Self {
            message: message.into(),
            code: 200,
            temperature: Some(reading),
        }
    }
}

impl From<&CommandError> for Response {
    fn from(error: &CommandError) -> Self {
        Self {
            message: error.to_string(),
            code: 400,
            temperature: None,
        }
    }
}
