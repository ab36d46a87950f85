use thiserror::Error;

/// Closed error taxonomy for the per-call media pipeline.
///
/// Variants map one-to-one onto the error classes a turn can hit: transient
/// external failures get one retry upstream before landing here, permanent
/// ones don't. Protocol and local-resource errors never abort a call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{stage} timed out or returned a transient error: {source}")]
    Transient {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} returned a permanent error: {source}")]
    Permanent {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed carrier frame: {0}")]
    Protocol(String),

    #[error("local resource error: {0}")]
    LocalResource(#[from] std::io::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn transient(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        GatewayError::Transient {
            stage,
            source: source.into(),
        }
    }

    pub fn permanent(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        GatewayError::Permanent {
            stage,
            source: source.into(),
        }
    }

    /// The event-type-ish tag surfaced to the dashboard `error` frame.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Transient { .. } => "transient",
            GatewayError::Permanent { .. } => "permanent",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::LocalResource(_) => "local_resource",
            GatewayError::Fatal(_) => "fatal",
        }
    }
}
