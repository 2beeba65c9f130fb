use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Failed to resolve a format for {item_id}: {reason}")]
    FormatResolution { item_id: String, reason: String },

    #[error("Connection to {url} failed: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{item_id}: Server returned code {status}")]
    BadStatus {
        item_id: String,
        status: http::StatusCode,
    },

    #[error("Invalid item id: {0:?}")]
    InvalidItemId(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Download failed after {bytes_downloaded} bytes: {source}")]
    Stream {
        bytes_downloaded: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error("Partial file has extension {found}, server now sends {expected}")]
    PartialMismatch { found: String, expected: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Download service is stopping")]
    ServiceStopped,

    #[error("STATUS_CHANGED is for output only")]
    OutputOnlyAction,
}

impl DownloadError {
    /// Whether retrying could plausibly help.
    ///
    /// Only used for logging: the retry loop retries every failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidItemId(_)
                | Self::UnsupportedContentType(_)
                | Self::ServiceStopped
                | Self::OutputOnlyAction
        )
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
