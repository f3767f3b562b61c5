use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an embedding provider for a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbedError {
    /// Network or API failure. `status` is `None` for transport errors.
    #[error("embedding request failed ({}): {message}", status_label(.status))]
    Api {
        status: Option<u16>,
        message: String,
        rate_limited: bool,
    },

    /// The provider ignored the requested dimensionality.
    #[error("dimension mismatch: got {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding response contained no values")]
    EmptyResponse,
}

impl EmbedError {
    /// Builds an API error, flagging it as rate limited for HTTP 429 or
    /// provider messages that read like quota exhaustion.
    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let rate_limited = status == Some(429) || looks_rate_limited(&message);
        Self::Api { status, message, rate_limited }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { rate_limited, message, .. } => *rate_limited || looks_rate_limited(message),
            _ => false,
        }
    }

    /// 5xx responses and transport failures (no status at all).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status: None, .. } => true,
            Self::Api { status: Some(code), .. } => (500..600).contains(code),
            _ => false,
        }
    }
}

const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "too many requests",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "429",
];

pub fn looks_rate_limited(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "transport".to_string(),
    }
}

/// Failure talking to the row store (fetch or write).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("store request failed: {0}")]
    Transport(String),

    #[error("could not decode store response: {0}")]
    Decode(String),

    #[error("unknown row {0}")]
    UnknownRow(String),
}

/// Checks a provider vector against the requested dimensionality.
pub fn check_dimension(
    vector: Vec<f32>,
    expected: usize,
) -> std::result::Result<Vec<f32>, EmbedError> {
    if vector.is_empty() {
        return Err(EmbedError::EmptyResponse);
    }
    if vector.len() != expected {
        return Err(EmbedError::DimensionMismatch { expected, actual: vector.len() });
    }
    Ok(vector)
}
