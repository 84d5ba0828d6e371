pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod oracle;
pub mod orchestration;
pub mod store;

pub use error::{Error, Result};
