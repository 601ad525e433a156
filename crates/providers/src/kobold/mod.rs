pub mod client;
pub mod config;
pub mod genkeys;
pub mod request;

pub use client::{CancelFailure, Dialect, KoboldClient};
pub use config::{GenerationConfig, KoboldConfig};
pub use genkeys::GenKeyRegistry;
