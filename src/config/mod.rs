//! Configuration module

pub mod cli;
pub mod command_map;
pub mod mux_config;

pub use cli::{CliArgs, OutputFormat, ReadPreference};
pub use command_map::CommandMap;
pub use mux_config::{AuthConfig, MuxConfig, Proxy, ServerAddress};
