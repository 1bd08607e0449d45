//! Configuration preparation for the IONOS Cloud image builder.
//!
//! Raw template sections are merged, interpolated and decoded into a [`Config`],
//! which is then defaulted (environment variables, built-in values) and validated.
//! The result is either a [`PreparedConfig`] ready for provisioning or a
//! [`ConfigErrors`] listing every problem found.

pub mod cli;
pub mod communicator;
pub mod config;
mod de;
pub mod env;
pub mod errors;
pub mod interpolate;
pub mod secrets;
pub mod template;

pub use config::{Config, PrepareOptions, PreparedConfig};
pub use errors::{BuilderError, ConfigErrors, ValidationError};
pub use secrets::SecretFilter;
