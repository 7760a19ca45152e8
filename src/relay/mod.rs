//! Realtime speech relay: browser ↔ vendor.

pub mod frame;
pub mod session;
pub mod vendor;
pub mod websocket;

pub use websocket::realtime_websocket;
