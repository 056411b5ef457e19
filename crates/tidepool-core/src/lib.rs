//! tidepool-core — shared types for the tidepool MongoDB driver.
//!
//! - **error**: the driver's error taxonomy ([`DriverError`])
//! - **options**: typed, validated client options
//! - **uri**: `mongodb://` connection-string parsing
//! - **config**: `tidepool.toml` configuration files

pub mod config;
pub mod error;
pub mod options;
pub mod uri;

pub use config::TidepoolConfig;
pub use error::{DriverError, Result};
pub use options::{
    Acknowledgment, ClientOptions, Credential, LivenessCheck, ServerAddress, TlsOptions,
    UuidRepresentation, WriteConcern,
};
