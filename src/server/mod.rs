//! Log server: store, viewer broadcaster and web endpoints

pub mod broadcaster;
pub mod handlers;
pub mod server;
pub mod store;
pub mod websocket;

pub use broadcaster::ViewerBroadcaster;
pub use server::{AppState, WebServer};
pub use store::LogStore;
