pub mod adapter;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod relay;
pub mod source;
pub mod stream;
pub mod supervisor;

pub use adapter::{AdapterEvent, AdapterHandle, EventSink, OpenRequest, SourceAdapter};
pub use config::{AdapterKind, ManagerConfig, QualityProfile, QualityProfiles};
pub use error::{MuxError, Result};
pub use events::StreamEvent;
pub use manager::StreamManager;
pub use relay::{Framing, RelayClient};
pub use source::{Quality, Source};
pub use stream::{StreamId, StreamState, StreamStatus};
