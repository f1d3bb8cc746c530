pub mod config;
pub mod kettle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;

pub use config::{KettleConfig, NetworkConfig, RuntimeConfig, SENSOR_SETTLE_MS};
pub use kettle::{KettleEngine, PinAction};
pub use protocol::{Command, CommandError, DeviceProfile, Response, VERIFY_QUESTION, VERIFY_SECRET};
pub use registry::{ClientChannel, ConnectionId, ConnectionRegistry, ResponseSink};
pub use server::ControlServer;
pub use state::{DeviceState, Rgb, TemperatureReading};
