use std::sync::Arc;

use crate::rules::RuleError;

/// Represents a result type for operations in the Mixpanel flags SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while fetching flag definitions or managing the polling lifecycle.
///
/// Flag evaluation never returns these. See [`EvaluationFailure`] for why an evaluation fell back.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid `api_host` configuration.
    #[error("invalid api_host configuration")]
    InvalidApiHost(#[source] url::ParseError),

    /// The request was unauthorized, the project token is likely invalid.
    #[error("unauthorized, project_token is likely invalid")]
    Unauthorized,

    /// The server answered with a non-success status code.
    #[error("unexpected response status {0} while fetching flag definitions")]
    HttpStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The definitions document could not be parsed.
    #[error("failed to parse flag definitions")]
    Parse(#[source] Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}

/// Reason a flag evaluation did not resolve a variant.
///
/// Public evaluation methods turn every failure into the caller's fallback.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluationFailure {
    /// The requested flag is not present in the current definitions.
    #[error("flag not found")]
    FlagNotFound,

    /// The context lacks the property the flag assigns on.
    #[error("context is missing property {0:?}")]
    ContextPropertyMissing(String),

    /// No rollout admitted the subject.
    #[error("no rollout matched")]
    NoRolloutMatched,

    /// A rollout matched but the variant it resolved to does not exist.
    #[error("variant {0:?} not found in ruleset")]
    VariantNotFound(String),

    /// A rollout matched but the ruleset has no variants to pick from.
    #[error("ruleset has no variants")]
    NoVariants,

    /// The runtime rule failed to evaluate.
    #[error(transparent)]
    RuleError(RuleError),
}

impl EvaluationFailure {
    /// Returns `true` for failures that indicate a misconfigured flag or context rather than a
    /// subject that simply didn't match.
    pub(crate) fn is_anomaly(&self) -> bool {
        !matches!(self, EvaluationFailure::NoRolloutMatched)
    }
}
