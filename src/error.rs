use thiserror::Error;

/// Failure taxonomy of the signal core.
///
/// Transient venue trouble never surfaces here: connectors retry with
/// backoff and the affected feed simply goes stale. These variants are the
/// failures the pipeline itself must answer for.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scenario library {path}: {reason}")]
    ScenarioLibrary { path: String, reason: String },

    #[error("signal store: {0}")]
    Store(String),

    #[error("candle fetch {symbol}/{timeframe}: {source}")]
    Fetch {
        symbol: String,
        timeframe: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("websocket: {0}")]
    Socket(String),
}

impl CoreError {
    /// Fatal errors refuse startup; everything else is a degraded tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_) | CoreError::ScenarioLibrary { .. }
        )
    }
}
