use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to start worker: {0:#}")]
    Spawn(anyhow::Error),

    #[error("no active session for channel `{0}`")]
    NoSession(String),

    #[error("worker input closed: {0}")]
    Input(#[from] std::io::Error),

    #[error("could not encode worker input: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("setting `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
