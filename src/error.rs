use serde_json::{json, Value};
use thiserror::Error;

use crate::envelope::codes;
use crate::model::ListingStatus;
use crate::{AgentId, ListingId, TransactionId};

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Listing not found: {0}")]
    ListingNotFound(ListingId),

    #[error("Listing {listing_id} is not available (status {status})")]
    ListingUnavailable {
        listing_id: ListingId,
        status: ListingStatus,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Purchase already in progress for this listing")]
    DuplicatePurchase { transaction_id: Option<TransactionId> },

    #[error("Offer rejected")]
    OfferRejected { listing_price: String, offer_price: String },

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Settlement failed: {reason}")]
    Settlement {
        transaction_id: TransactionId,
        reason: String,
    },

    #[error("Settlement did not answer in time; transaction {transaction_id} remains pending")]
    SettlementTimeout { transaction_id: TransactionId },

    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn code(&self) -> i64 {
        match self {
            MarketError::Parse(_) => codes::PARSE_ERROR,
            MarketError::InvalidRequest(_) => codes::INVALID_REQUEST,
            MarketError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            MarketError::InvalidParams(_)
            | MarketError::AgentNotFound(_)
            | MarketError::TransactionNotFound(_) => codes::INVALID_PARAMS,
            MarketError::Unauthorized(_) => codes::UNAUTHORIZED,
            MarketError::ListingNotFound(_) | MarketError::ListingUnavailable { .. } => {
                codes::LISTING_NOT_FOUND
            }
            MarketError::PolicyViolation(_) | MarketError::DuplicatePurchase { .. } => {
                codes::POLICY_VIOLATION
            }
            MarketError::OfferRejected { .. } => codes::OFFER_REJECTED,
            MarketError::InvalidPrice(_) => codes::INVALID_PRICE,
            MarketError::Settlement { .. } => codes::SETTLEMENT_FAILED,
            MarketError::SettlementTimeout { .. } => codes::SETTLEMENT_TIMEOUT,
            MarketError::Remote { code, .. } => *code,
            MarketError::Config(_)
            | MarketError::Crypto(_)
            | MarketError::Database(_)
            | MarketError::Network(_)
            | MarketError::Serialization(_)
            | MarketError::Io(_)
            | MarketError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Message placed on the wire. Store, transport and key failures are
    /// reported generically; the detail only goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            MarketError::Config(_)
            | MarketError::Crypto(_)
            | MarketError::Database(_)
            | MarketError::Network(_)
            | MarketError::Serialization(_)
            | MarketError::Io(_) => "Internal error".to_string(),
            MarketError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            MarketError::ListingUnavailable { listing_id, status } => {
                Some(json!({ "listingId": listing_id, "status": status }))
            }
            MarketError::DuplicatePurchase { transaction_id } => Some(json!({
                "reason": "DUPLICATE_IN_PROGRESS",
                "transactionId": transaction_id,
            })),
            MarketError::OfferRejected { listing_price, offer_price } => Some(json!({
                "decision": "REJECT",
                "listingPrice": listing_price,
                "offerPrice": offer_price,
            })),
            MarketError::Settlement { transaction_id, .. } => Some(json!({
                "transactionId": transaction_id,
                "status": "FAILED",
            })),
            MarketError::SettlementTimeout { transaction_id } => Some(json!({
                "transactionId": transaction_id,
                "status": "PENDING",
            })),
            MarketError::Remote { data, .. } => data.clone(),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.code() == codes::INTERNAL_ERROR
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for MarketError {
    fn from(err: uuid::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<rust_decimal::Error> for MarketError {
    fn from(err: rust_decimal::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}
