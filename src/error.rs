use std::time::Duration;

use crate::config::ConfigError;

/// Which half of the two-phase protocol a request was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Prefill => write!(f, "prefill"),
            Phase::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PDError {
    #[error("We currently do not support {feature} for P/D")]
    UnsupportedFeature { feature: &'static str },

    #[error("{operation} is not supported by the P/D coordinator")]
    NotSupported { operation: &'static str },

    #[error("Found duplicate request_id: {0}")]
    DuplicateRequest(String),

    #[error("Failed prefill request {0}")]
    PrefillFailed(String),

    #[error("Failed decode request {0}")]
    DecodeFailed(String),

    #[error("Response for request {got} was routed to request {expected}")]
    RequestIdMismatch { expected: String, got: String },

    #[error("Request {request_id} timed out after {timeout:?} waiting for {phase}")]
    Timeout {
        request_id: String,
        phase: Phase,
        timeout: Duration,
    },

    #[error("Request {request_id} aborted: {reason}")]
    Aborted { request_id: String, reason: String },

    #[error("Coordinator failed: {0}")]
    CoordinatorFailed(String),

    #[error("Coordinator is shut down")]
    ShutDown,

    #[error("Invalid endpoint address '{0}' (expected ipc://<path> or tcp://<host>:<port>)")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PDError {
    /// Errors raised by the validation gate, before any registry change or I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PDError::UnsupportedFeature { .. } | PDError::DuplicateRequest(_) | PDError::Config(_)
        )
    }
}

pub type PDResult<T> = Result<T, PDError>;
