use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rust_decimal::Decimal;
use thiserror::Error;

/// Which side of the payment is absent from the transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Party {
    Payer,
    Merchant,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Payer => write!(f, "payer"),
            Party::Merchant => write!(f, "merchant"),
        }
    }
}

/// Everything that can go wrong between an unlock request arriving and the
/// ledger row being written. Duplicate unlocks are deliberately NOT here;
/// they are a success outcome.
#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("invalid request: {0}")]
    MissingField(String),
    #[error("invalid {0} address")]
    InvalidAddress(&'static str),
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("invalid transaction signature")]
    BadSignature,
    #[error("chapter not found")]
    ItemNotFound,
    #[error("chapter is not a premium chapter")]
    ItemNotPremium,
    #[error("transaction not found on chain")]
    TransactionNotFound,
    #[error("transaction failed on chain")]
    OnChainFailure,
    #[error("{0} is not a party to this transaction")]
    PartyMissing(Party),
    #[error("token balance data missing from transaction")]
    BalanceDataMissing,
    #[error("transferred amount {actual} outside accepted range [{min}, {max}]")]
    AmountMismatch { actual: Decimal, min: Decimal, max: Decimal },
    #[error("funds were not received by the merchant wallet")]
    RecipientMismatch,
    #[error("failed to persist unlock: {0}")]
    Storage(String),
}

impl UnlockError {
    pub fn status(&self) -> StatusCode {
        match self {
            UnlockError::ItemNotFound => StatusCode::NOT_FOUND,
            UnlockError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UnlockError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("unlock failed: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_names_render_lowercase() {
        assert_eq!(UnlockError::PartyMissing(Party::Merchant).to_string(), "merchant is not a party to this transaction");
        assert_eq!(UnlockError::PartyMissing(Party::Payer).to_string(), "payer is not a party to this transaction");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(UnlockError::ItemNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(UnlockError::Storage("io".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(UnlockError::RecipientMismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(UnlockError::TransactionNotFound.status(), StatusCode::BAD_REQUEST);
    }
}
