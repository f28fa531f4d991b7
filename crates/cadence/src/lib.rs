//! Cadence
//!
//! Media library maintenance host built on `cadence_runtime`:
//! - `config`: layered configuration
//! - `logging`: tracing subscriber setup
//! - `plugins`: built-in maintenance plugins, registered at link time
//! - `scan`: media import
//! - `app`: wiring everything into a running host

pub mod app;
pub mod config;
pub mod logging;
pub mod plugins;
pub mod scan;

pub use app::App;
pub use config::CadenceConfig;
