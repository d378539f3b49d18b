//! Configuration loading for the read-aloud host.
//!
//! Settings live in `conf/config.toml` as sectioned tables. Any missing or
//! invalid entries fall back to defaults so playback can still start.

mod defaults;
mod io;
mod models;
mod tables;

pub use io::{load_config, parse_config, serialize_config};
pub use models::{AppConfig, LogLevel};
