pub mod config;
pub mod core;
pub mod decompose;
pub mod error;
pub mod log;
pub mod transport;

// Actor runtime
pub mod actors;
pub mod orchestration;
pub mod system;

pub use error::{Error, Result};
pub use system::{System, SystemBuilder};
