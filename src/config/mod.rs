//! Configuration for the query server client.

mod settings;

pub use settings::{
    expand_env_vars, HistorySettings, QueryServerConfig, ServerSettings, Settings, SettingsError,
};
