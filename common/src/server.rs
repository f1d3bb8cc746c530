use log::{debug, info, warn};

use crate::{
    config::KettleConfig,
    kettle::{KettleEngine, PinAction},
    protocol::{Command, CommandError, DeviceProfile, Response, VERIFY_QUESTION, VERIFY_SECRET},
    registry::{ConnectionId, ConnectionRegistry, ResponseSink},
};

/// Top-level control core: owns the engine, the connection registry, and
/// the device profile, and turns transport events into state changes and
/// pin actions.
///
/// The firmware shell keeps exactly one of these behind one mutex. Every
/// method runs to completion without blocking, so the lock is only ever
/// held for a state change and the pin writes it produced, never across
/// the sensor settle wait or response I/O.
#[derive(Debug)]
pub struct ControlServer<S> {
    profile: DeviceProfile,
    engine: KettleEngine,
    registry: ConnectionRegistry<S>,
}

impl<S: ResponseSink> ControlServer<S> {
    pub fn new(config: KettleConfig, profile: DeviceProfile) -> Self {
        Self {
            profile,
            engine: KettleEngine::new(config),
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn engine(&self) -> &KettleEngine {
        &self.engine
    }

    pub fn startup_actions(&self) -> Vec<PinAction> {
        self.engine.startup_actions()
    }

    pub fn register(&mut self, remote_host: String, sink: S) -> ConnectionId {
        self.registry.open(remote_host, sink)
    }

    pub fn unregister(&mut self, id: ConnectionId) {
        self.registry.close(id);
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Entry point for one raw text frame from a client. Responds on the
    /// channel exactly once and returns the pin writes the shell must
    /// apply. Messages for connections that already closed are dropped.
    pub fn handle_message(&mut self, id: ConnectionId, raw: &str) -> Vec<PinAction> {
        let Some(channel) = self.registry.get(id) else {
            warn!("dropping message for a connection that is no longer open");
            return Vec::new();
        };
        info!(
            "received new message from '{}' aka '{}'",
            channel.remote_host(),
            channel.identity()
        );

        let command = match Command::parse(self.profile, raw) {
            Ok(command) => command,
            Err(error) => {
                channel.respond(&Response::from(&error));
                return Vec::new();
            }
        };

        self.dispatch(id, command)
    }

    /// Binary frames have no defined handler in this protocol version.
    pub fn handle_binary(&mut self, id: ConnectionId) {
        match self.registry.get(id) {
            Some(channel) => debug!(
                "ignoring binary frame from '{}' aka '{}'",
                channel.remote_host(),
                channel.identity()
            ),
            None => warn!("dropping binary frame for a connection that is no longer open"),
        }
    }

    /// Feeds the monitor's sampling result into the engine (and through it,
    /// the safety interlock). `None` marks the reading unknown.
    pub fn ingest_sample(&mut self, reading: Option<f32>) -> Vec<PinAction> {
        self.engine.record_sample(reading)
    }

    fn dispatch(&mut self, id: ConnectionId, command: Command) -> Vec<PinAction> {
        let Some(channel) = self.registry.get_mut(id) else {
            warn!("connection closed between parse and dispatch");
            return Vec::new();
        };

        match command {
            Command::Ping => {
                channel.respond(&Response::ok("Ping received! We have a connection!"));
                Vec::new()
            }
            Command::SetName { name } => {
                info!(
                    "connection from '{}' named themselves '{}'",
                    channel.remote_host(),
                    name
                );
                channel.set_identity(name);
                channel.respond(&Response::ok("Your name was set"));
                Vec::new()
            }
            Command::Verify { question } => {
                if question == VERIFY_QUESTION {
                    channel.respond(&Response::ok(VERIFY_SECRET));
                } else {
                    channel.respond(&Response::from(&CommandError::VerificationFailed));
                }
                Vec::new()
            }
            Command::LedOn => {
                let actions = self.engine.set_heater(true);
                channel.respond(&Response::ok("Led turned on"));
                actions
            }
            Command::LedOff => {
                let actions = self.engine.set_heater(false);
                channel.respond(&Response::ok("Led turned off"));
                actions
            }
            Command::KettleOn => {
                let actions = self.engine.set_heater(true);
                channel.respond(&Response::ok("Kettle turned on"));
                actions
            }
            Command::KettleOff => {
                let actions = self.engine.set_heater(false);
                channel.respond(&Response::ok("Kettle turned off"));
                actions
            }
            Command::GetCurrentTemperature => {
                channel.respond(&Response::with_temperature(
                    "Current temperature attached",
                    self.engine.current_temperature(),
                ));
                Vec::new()
            }
            Command::SetColor { color } => {
                let actions = self.engine.set_color(color);
                channel.respond(&Response::ok("Color was set"));
                actions
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::RecordingSink;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn kettle_server() -> ControlServer<RecordingSink> {
        ControlServer::new(KettleConfig::default(), DeviceProfile::Kettle)
    }

    fn connect(server: &mut ControlServer<RecordingSink>) -> (ConnectionId, RecordingSink) {
        let sink = RecordingSink::default();
        let id = server.register("10.0.0.7".to_string(), sink.clone());
        (id, sink)
    }

    fn last_response(sink: &RecordingSink) -> Value {
        let payloads = sink.payloads();
        serde_json::from_str(payloads.last().expect("no response delivered")).unwrap()
    }

    fn assert_pairing(server: &ControlServer<RecordingSink>) {
        let state = server.engine().state();
        assert_eq!(state.led_indicator, !state.relay_engaged);
    }

    #[test]
    fn ping_confirms_the_connection() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let actions = server.handle_message(id, r#"{"command":"ping"}"#);

        assert!(actions.is_empty());
        assert_eq!(
            last_response(&sink),
            json!({"message": "Ping received! We have a connection!", "code": 200})
        );
    }

    #[test]
    fn malformed_payload_yields_400_without_dispatch() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let actions = server.handle_message(id, "{truncated");

        assert!(actions.is_empty());
        assert_eq!(
            last_response(&sink),
            json!({"message": "Your message couldn't be parsed to json!", "code": 400})
        );
    }

    #[test]
    fn verify_scenario_matches_the_shared_secret() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let _ = server.handle_message(
            id,
            r#"{"command":"verify","question":"Which team is the best"}"#,
        );
        assert_eq!(
            last_response(&sink),
            json!({"message": "Sprytne Dzbany", "code": 200})
        );

        let _ = server.handle_message(id, r#"{"command":"verify","question":"wrong"}"#);
        assert_eq!(
            last_response(&sink),
            json!({"message": "Wrong question!", "code": 400})
        );
    }

    #[test]
    fn set_name_changes_attribution_for_later_messages() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let _ = server.handle_message(id, r#"{"command":"setName","name":"Alice"}"#);

        assert_eq!(
            last_response(&sink),
            json!({"message": "Your name was set", "code": 200})
        );
        assert!(server.handle_message(id, r#"{"command":"ping"}"#).is_empty());
        // Identity sticks on the channel, and renaming is repeatable.
        let _ = server.handle_message(id, r#"{"command":"setName","name":"Bob"}"#);
        assert_eq!(
            last_response(&sink),
            json!({"message": "Your name was set", "code": 200})
        );
    }

    #[test]
    fn kettle_on_engages_heater_and_led_together() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let actions = server.handle_message(id, r#"{"command":"kettleOn"}"#);

        assert_eq!(
            actions,
            vec![PinAction::SetRelay(false), PinAction::SetLed(true)]
        );
        assert_pairing(&server);
        assert_eq!(
            last_response(&sink),
            json!({"message": "Kettle turned on", "code": 200})
        );
    }

    #[test]
    fn kettle_off_twice_is_idempotent_with_two_confirmations() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);
        let _ = server.handle_message(id, r#"{"command":"kettleOn"}"#);

        let _ = server.handle_message(id, r#"{"command":"kettleOff"}"#);
        let first_state = server.engine().state().clone();
        let _ = server.handle_message(id, r#"{"command":"kettleOff"}"#);

        assert_eq!(server.engine().state(), &first_state);
        assert!(server.engine().state().relay_engaged);
        assert_pairing(&server);

        let confirmations: Vec<Value> = sink
            .payloads()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .filter(|value: &Value| value["message"] == "Kettle turned off")
            .collect();
        assert_eq!(confirmations.len(), 2);
        assert!(confirmations.iter().all(|value| value["code"] == 200));
    }

    #[test]
    fn temperature_query_reports_null_until_a_sample_lands() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let _ = server.handle_message(id, r#"{"command":"getCurrentTemperature"}"#);
        let response = last_response(&sink);
        assert_eq!(response["code"], 200);
        assert!(response["temperature"].is_null());

        let _ = server.ingest_sample(Some(42.5));
        let _ = server.handle_message(id, r#"{"command":"getCurrentTemperature"}"#);
        assert_eq!(last_response(&sink)["temperature"], Value::from(42.5));
    }

    #[test]
    fn failed_sample_reverts_the_query_to_null() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let _ = server.ingest_sample(Some(42.5));
        let actions = server.ingest_sample(None);
        assert!(actions.is_empty());

        let _ = server.handle_message(id, r#"{"command":"getCurrentTemperature"}"#);
        assert!(last_response(&sink)["temperature"].is_null());
    }

    #[test]
    fn interlock_and_command_paths_share_one_shutoff() {
        let mut server = kettle_server();
        let (id, _sink) = connect(&mut server);
        let _ = server.handle_message(id, r#"{"command":"kettleOn"}"#);

        // Interlock crossing turns the pair off exactly once...
        let actions = server.ingest_sample(Some(60.0));
        assert_eq!(
            actions,
            vec![PinAction::SetRelay(true), PinAction::SetLed(false)]
        );
        assert_pairing(&server);

        // ...and a kettleOn racing in afterward simply re-engages it; the
        // pairing invariant holds whichever side committed last.
        let actions = server.handle_message(id, r#"{"command":"kettleOn"}"#);
        assert_eq!(
            actions,
            vec![PinAction::SetRelay(false), PinAction::SetLed(true)]
        );
        assert_pairing(&server);
    }

    #[test]
    fn set_color_updates_state_and_emits_duty_writes() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        let actions =
            server.handle_message(id, r#"{"command":"setColor","r":255,"g":20,"b":0}"#);

        assert_eq!(
            actions,
            vec![PinAction::SetColor(crate::state::Rgb::new(255, 20, 0))]
        );
        assert_eq!(
            last_response(&sink),
            json!({"message": "Color was set", "code": 200})
        );
    }

    #[test]
    fn minimal_profile_rejects_kettle_commands_as_unknown() {
        let mut server: ControlServer<RecordingSink> =
            ControlServer::new(KettleConfig::default(), DeviceProfile::Minimal);
        let (id, sink) = connect(&mut server);

        let actions = server.handle_message(id, r#"{"command":"kettleOn"}"#);

        assert!(actions.is_empty());
        assert_eq!(
            last_response(&sink),
            json!({"message": "There is no command named 'kettleOn'!", "code": 400})
        );
    }

    #[test]
    fn messages_after_close_fail_closed() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);
        server.unregister(id);

        let actions = server.handle_message(id, r#"{"command":"ping"}"#);
        server.handle_binary(id);

        assert!(actions.is_empty());
        assert!(sink.payloads().is_empty());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn binary_frames_are_ignored() {
        let mut server = kettle_server();
        let (id, sink) = connect(&mut server);

        server.handle_binary(id);

        assert!(sink.payloads().is_empty());
        assert_eq!(server.connection_count(), 1);
    }
}
