//! Typed errors for the ledger and chain client boundaries
//!
//! Controller retry heuristics match on error *messages* (the source APIs
//! only speak strings), so every variant preserves the upstream text
//! verbatim. Controllers wrap these in `anyhow` for propagation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-2xx response or `error` field from the DEX/indexer API.
    #[error("ledger error ({status}): {message}")]
    Ledger { status: u16, message: String },

    /// Non-2xx response from a Bitcoin REST endpoint.
    #[error("chain error ({status}): {message}")]
    Chain { status: u16, message: String },

    /// Broadcast rejected because the transaction is already known.
    /// The chain client promotes this to success when it can recover the
    /// txid; this variant surfaces only when no txid was recoverable.
    #[error("transaction already in mempool")]
    AlreadyInMempool,

    /// State store request failed (auth, connectivity, bad response).
    #[error("state store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl ApiError {
    /// The upstream message, for string-matching heuristics.
    pub fn message(&self) -> String {
        match self {
            ApiError::Ledger { message, .. } | ApiError::Chain { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_preserved() {
        let err = ApiError::Ledger {
            status: 400,
            message: "insufficient BTC at address bc1qexample".to_string(),
        };
        assert!(err.message().contains("insufficient BTC"));
        assert!(err.to_string().contains("400"));
    }
}
