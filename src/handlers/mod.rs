pub mod config;
pub mod voice_session;

pub use config::*;
pub use voice_session::*;
