//! Corral - capture instance pool daemon
//!
//! Keeps a pen of headless capture instances: durable configuration with a
//! schema-driven sanitizer, per-instance worker lifecycle, a terse REST
//! controller for wall consoles, a richer dashboard API, bundle
//! import/export, autosave, and syslog alerting.

pub mod bundle;
pub mod dashboard;
pub mod error;
pub mod http;
pub mod instance;
pub mod media;
pub mod notify;
pub mod persist;
pub mod registry;
pub mod rest;
pub mod schema;
pub mod serve;
pub mod telemetry;
pub mod worker;

pub use error::ControlError;
pub use instance::{InstanceConfig, InstanceId};
pub use registry::{Registry, RegistryEvent};
