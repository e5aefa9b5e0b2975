//! Error taxonomy surfaced to API callers and the scheduler.

use alloy_primitives::Address;

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Neither RPC endpoint answered on the expected chain.
    #[error("no RPC endpoint available: {0}")]
    EndpointUnavailable(String),
    #[error("a sync pass is already in progress")]
    SyncInProgress,
    #[error("{0} is not the contract owner")]
    Unauthorized(Address),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0:#}")]
    Internal(eyre::Report),
}

impl IndexerError {
    /// Short machine-readable tag, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndpointUnavailable(_) => "endpoint_unavailable",
            Self::SyncInProgress => "sync_in_progress",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidInput(_) => "invalid_input",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<eyre::Report> for IndexerError {
    fn from(report: eyre::Report) -> Self {
        // Keep the typed variant when a selector error was wrapped with context.
        match report.downcast::<IndexerError>() {
            Ok(inner) => inner,
            Err(report) => Self::Internal(report),
        }
    }
}

/// Parses a user-supplied address; any malformed input is rejected before network I/O.
pub fn parse_address(raw: &str) -> Result<Address, IndexerError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| IndexerError::InvalidInput(format!("malformed address {raw:?}")))
}
