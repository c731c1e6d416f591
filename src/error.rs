use thiserror::Error;

/// Failures that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("geocode error for {address:?}: {reason}")]
    Geocode { address: String, reason: String },

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn geocode(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Geocode {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}
