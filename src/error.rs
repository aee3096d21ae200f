use crate::store::StoreError;

/// Failures surfaced by the mail provider client.
#[derive(Debug, Clone)]
pub enum ProviderError {
    NetworkError(String),
    ApiError { status: u16, message: String },
    AuthError(String),
    ParseError(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkError(e) => write!(f, "Network error: {e}"),
            Self::ApiError { status, message } => write!(f, "API error ({status}): {message}"),
            Self::AuthError(e) => write!(f, "Auth error: {e}"),
            Self::ParseError(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Top-level error taxonomy. Only `NotConnected` and `Provider` cross the
/// `sync_user` boundary; per-message problems are absorbed into
/// [`crate::models::SyncStats`].
#[derive(Debug)]
pub enum SyncError {
    /// No usable credential for the user; caller should prompt reconnection.
    NotConnected,
    Provider(ProviderError),
    Store(StoreError),
    InvalidNotification(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Mailbox not connected"),
            Self::Provider(e) => write!(f, "Provider error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::InvalidNotification(e) => write!(f, "Invalid notification: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
