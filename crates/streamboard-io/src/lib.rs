pub mod generators;
pub mod hdf;
pub mod microphone;
pub mod network;
pub mod wav;

pub use generators::{NoiseGenerator, SineGenerator};
pub use hdf::{ChunkSink, PersistedRecord, RotatingFileSink, SinkSummary};
pub use microphone::MicrophoneSource;
pub use network::{NetworkClient, NetworkServer};
pub use wav::WavSource;
