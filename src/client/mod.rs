//! Viewer client: transport, batching, buffering and auto-pause

pub mod backpressure;
pub mod batcher;
pub mod buffer;
pub mod connector;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod watches;

pub use backpressure::{AutoPauseController, AutoPauseEvent, CommandSink};
pub use batcher::{BatchScheduler, FlushReport};
pub use buffer::{BoundedBuffer, IngestionBuffer};
pub use session::{ViewerCommand, ViewerEvent, ViewerHandle, ViewerSession, ViewerState};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{ConnectionState, TransportClient, TransportStatus};
pub use watches::WatchTable;
