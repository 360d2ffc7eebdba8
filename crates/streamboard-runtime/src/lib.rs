pub mod board;
pub mod composite;
pub mod messages;
pub mod processor;
pub mod subscription;

pub use board::Board;
pub use composite::{CompositeChunk, CompositeManager};
pub use messages::{BoardMessage, ProcessorMessage};
pub use processor::{InputProcessor, OutputHandles, Processor, ProducedData, POLL_TIMEOUT};
pub use subscription::{
    make_channel, NetworkRole, NetworkSubscriptionOrder, SubscriptionOrder,
    DEFAULT_CHANNEL_CAPACITY,
};
