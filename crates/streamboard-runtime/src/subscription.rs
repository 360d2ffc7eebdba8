use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use streamboard_foundation::chunk::Chunk;

/// Default bound on a local inter-processor channel. A producer blocks on
/// `send` once a lagging consumer fills this, implementing the local
/// back-pressure rule from the concurrency model.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Subscribe `subscriber_name`'s `receiver_key` input to `processor_name`'s
/// `sender_key` output. Creation order between orders is free; the Board
/// wires the subscription as soon as both processors exist.
#[derive(Debug, Clone)]
pub struct SubscriptionOrder {
    pub processor_name: String,
    pub subscriber_name: String,
    pub sender_key: String,
    pub receiver_key: String,
}

impl SubscriptionOrder {
    pub fn new(
        processor_name: impl Into<String>,
        subscriber_name: impl Into<String>,
        sender_key: impl Into<String>,
        receiver_key: impl Into<String>,
    ) -> Self {
        Self {
            processor_name: processor_name.into(),
            subscriber_name: subscriber_name.into(),
            sender_key: sender_key.into(),
            receiver_key: receiver_key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkRole {
    Server,
    Client,
}

/// A subscription fed from, or fanned out to, a remote peer instead of a
/// local sibling processor (see the TCP fan-out boundary, §6.3).
#[derive(Debug, Clone)]
pub struct NetworkSubscriptionOrder {
    pub sender_key: String,
    pub receiver_key: String,
    pub host: String,
    pub port: u16,
    pub role: NetworkRole,
}

/// Create the paired ends of a local subscription channel.
pub fn make_channel() -> (mpsc::Sender<Chunk>, mpsc::Receiver<Chunk>) {
    mpsc::channel(DEFAULT_CHANNEL_CAPACITY)
}
