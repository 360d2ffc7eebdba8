use tokio::sync::mpsc;

use streamboard_foundation::chunk::Chunk;

use crate::subscription::{NetworkSubscriptionOrder, SubscriptionOrder};

/// Messages sent from the Board down to a processor task's control channel.
pub enum BoardMessage {
    Stop,
    /// Install a publishing endpoint for `sender_key` (this processor is the
    /// producer side of the subscription).
    Subscribe {
        sender_key: String,
        tx: mpsc::Sender<Chunk>,
        order: SubscriptionOrder,
    },
    /// Install a receiving endpoint for `receiver_key` (this processor is
    /// the consumer side of the subscription).
    Subscription {
        receiver_key: String,
        rx: mpsc::Receiver<Chunk>,
        order: SubscriptionOrder,
    },
    NetworkSubscription(NetworkSubscriptionOrder),
    /// Handshake sent immediately after spawn: the receiver keys the Board
    /// is about to wire up. The processor validates these against its
    /// `required_keys()` and reports a `ConfigError` if any are unknown.
    TestRequiredKeys(Vec<String>),
}

/// Messages sent from a processor task up to the Board.
pub enum ProcessorMessage {
    Error {
        kind: &'static str,
        message: String,
        name: String,
    },
    /// Processor left its main loop cleanly (`Stop` received or input
    /// exhausted after `Continuity::Last`).
    Finished { name: String },
}
