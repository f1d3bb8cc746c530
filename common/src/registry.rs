use std::collections::HashMap;

use log::{info, warn};

use crate::protocol::Response;

/// Outbound half of a client channel. Delivery is an enqueue, not a
/// confirmation: implementations must return immediately and never block
/// the caller on socket I/O.
pub trait ResponseSink {
    fn deliver(&self, payload: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// One open client connection: its chosen display name, where it came
/// from, and the handle used to schedule responses back to it.
#[derive(Debug)]
pub struct ClientChannel<S> {
    identity: String,
    remote_host: String,
    sink: S,
}

impl<S: ResponseSink> ClientChannel<S> {
    fn new(remote_host: String, sink: S) -> Self {
        Self {
            identity: "Unnamed".to_string(),
            remote_host,
            sink,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn set_identity(&mut self, identity: String) {
        self.identity = identity;
    }

    pub fn respond(&self, response: &Response) {
        match serde_json::to_string(response) {
            Ok(payload) => self.sink.deliver(payload),
            Err(err) => warn!(
                "dropping response to '{}': serialization failed: {err}",
                self.remote_host
            ),
        }
    }
}

/// Tracks the channels between the transport's open and close events.
/// A channel that has been closed is gone: later dispatch attempts against
/// its id fail closed instead of reaching a dead socket.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    channels: HashMap<u64, ClientChannel<S>>,
    next_id: u64,
}

impl<S: ResponseSink> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn open(&mut self, remote_host: String, sink: S) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;

        let channel = ClientChannel::new(remote_host, sink);
        info!(
            "new connection from '{}' aka '{}'",
            channel.remote_host(),
            channel.identity()
        );
        let _ = self.channels.insert(id, channel);
        ConnectionId(id)
    }

    pub fn close(&mut self, id: ConnectionId) {
        match self.channels.remove(&id.0) {
            Some(channel) => info!(
                "connection from '{}' aka '{}' closed!",
                channel.remote_host(),
                channel.identity()
            ),
            None => warn!("close event for a connection that was never open"),
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ClientChannel<S>> {
        self.channels.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ClientChannel<S>> {
        self.channels.get_mut(&id.0)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl<S: ResponseSink> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::ResponseSink;

    /// Collects delivered payloads so tests can assert on the wire output.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        payloads: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        pub fn payloads(&self) -> Vec<String> {
            self.payloads.lock().unwrap().clone()
        }
    }

    impl ResponseSink for RecordingSink {
        fn deliver(&self, payload: String) {
            self.payloads.lock().unwrap().push(payload);
        }
    }
}
