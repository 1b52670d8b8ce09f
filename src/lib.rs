pub mod config;
pub mod format;
pub mod session;
pub mod store;
pub mod voice_tracker;
