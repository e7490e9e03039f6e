//! Typed errors at the media crate boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no provider available for {family}/{id}")]
    NoProviderAvailable { family: &'static str, id: String },

    #[error("provider {family}/{id} already registered")]
    DuplicateProvider { family: &'static str, id: String },

    #[error("'{name}' is not live-adjustable; allowed: {allowed:?}")]
    NotLiveAdjustable { name: String, allowed: Vec<String> },

    #[error("invalid config: {field}={value}, allowed {allowed}")]
    InvalidConfig {
        field: String,
        value: String,
        allowed: String,
    },

    #[error("failed to create element '{0}'")]
    ElementCreate(String),

    #[error("failed to link {from} → {to}")]
    Link { from: String, to: String },

    #[error("state change failed: {0}")]
    StateChange(String),

    #[error("pipeline is not streaming")]
    NotStreaming,

    #[error("pipeline is busy: {0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Unavailable(String),
}
