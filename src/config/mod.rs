//! Run configuration: the YAML settings file and duration strings.

pub mod duration;
pub mod settings;

pub use duration::{format_duration, parse_duration};
pub use settings::{BrokerSettings, RelaySettings, SettingsError, SourceSettings};
