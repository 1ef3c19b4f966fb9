pub mod config;
pub mod error;
pub mod notice;
pub mod transfer;

pub use config::{AutoscanSettings, IngestConfig, ManagerSettings, ManagerTarget, WorkerConfig};
pub use error::*;
pub use notice::*;
pub use transfer::*;
