//! Completion rosters on disk and scheduler configuration.
#![forbid(unsafe_code)]

pub mod config;
pub mod roster;

pub use config::{
    ConfigError, ConfigSource, MAX_RADIUS, SchedulerConfig, StaticConfig, TomlConfigFile,
};
pub use roster::{RosterError, RosterStore, read_roster, write_roster};
