use crate::{wallet::canonical_bytes, AgentId, ListingId, MarketError, Result, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Buyer,
    Seller,
    Marketplace,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Buyer => "BUYER",
            AgentRole::Seller => "SELLER",
            AgentRole::Marketplace => "MARKETPLACE",
        }
    }

    pub fn can_sell(&self) -> bool {
        matches!(self, AgentRole::Seller | AgentRole::Marketplace)
    }
}

impl FromStr for AgentRole {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BUYER" => Ok(AgentRole::Buyer),
            "SELLER" => Ok(AgentRole::Seller),
            "MARKETPLACE" => Ok(AgentRole::Marketplace),
            other => Err(MarketError::Serialization(format!("Invalid agent role: {}", other))),
        }
    }
}

/// Per-agent spending constraints checked on every authenticated spend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub max_transaction_value: Decimal,
    pub daily_spending_limit: Decimal,
    #[serde(default)]
    pub approved_counterparties: Vec<String>,
    pub max_gas_price: Decimal,
    pub allowed_assets: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_transaction_value: dec!(100),
            daily_spending_limit: dec!(1000),
            approved_counterparties: vec![],
            max_gas_price: dec!(50),
            allowed_assets: vec!["USDC".to_string()],
        }
    }
}

/// The facts of one prospective spend, gathered inside the purchase
/// transaction.
#[derive(Debug, Clone)]
pub struct SpendCheck<'a> {
    pub amount: Decimal,
    pub asset: &'a str,
    pub counterparty: &'a str,
    pub spent_today: Decimal,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        if self.max_transaction_value <= Decimal::ZERO {
            return Err(MarketError::InvalidParams(
                "maxTransactionValue must be greater than 0".to_string(),
            ));
        }
        if self.daily_spending_limit < self.max_transaction_value {
            return Err(MarketError::InvalidParams(
                "dailySpendingLimit must be at least maxTransactionValue".to_string(),
            ));
        }
        if self.max_gas_price < Decimal::ZERO {
            return Err(MarketError::InvalidParams("maxGasPrice cannot be negative".to_string()));
        }
        if self.allowed_assets.is_empty() {
            return Err(MarketError::InvalidParams("allowedAssets cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn check_spend(&self, check: &SpendCheck<'_>) -> Result<()> {
        if check.amount > self.max_transaction_value {
            return Err(MarketError::PolicyViolation(format!(
                "amount {} exceeds max transaction value {}",
                check.amount, self.max_transaction_value
            )));
        }
        if !self.allows_asset(check.asset) {
            return Err(MarketError::PolicyViolation(format!(
                "asset {} is not allowed",
                check.asset
            )));
        }
        if !self.approves_counterparty(check.counterparty) {
            return Err(MarketError::PolicyViolation(format!(
                "counterparty {} is not approved",
                check.counterparty
            )));
        }
        if check.spent_today + check.amount > self.daily_spending_limit {
            return Err(MarketError::PolicyViolation(format!(
                "daily spending limit {} would be exceeded ({} already spent today)",
                self.daily_spending_limit, check.spent_today
            )));
        }
        Ok(())
    }

    pub fn allows_asset(&self, asset: &str) -> bool {
        self.allowed_assets.iter().any(|a| a.eq_ignore_ascii_case(asset))
    }

    pub fn approves_counterparty(&self, address: &str) -> bool {
        self.approved_counterparties.is_empty()
            || self
                .approved_counterparties
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Hex SHA-256 of the canonical JSON form.
    pub fn hash(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(hex::encode(Sha256::digest(canonical_bytes(&value))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub public_key: String,
    pub wallet_address: Option<String>,
    pub policy: Policy,
    pub transaction_count: i64,
    pub volume: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: AgentId, name: String, role: AgentRole, public_key: String, policy: Policy) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            role,
            public_key,
            wallet_address: None,
            policy,
            transaction_count: 0,
            volume: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MarketError::InvalidParams("Agent name cannot be empty".to_string()));
        }
        if self.public_key.len() != 64 || hex::decode(&self.public_key).is_err() {
            return Err(MarketError::InvalidParams(
                "publicKey must be a 32-byte hex-encoded ed25519 key".to_string(),
            ));
        }
        self.policy.validate()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Available,
    Pending,
    Sold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "AVAILABLE",
            ListingStatus::Pending => "PENDING",
            ListingStatus::Sold => "SOLD",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AVAILABLE" => Ok(ListingStatus::Available),
            "PENDING" => Ok(ListingStatus::Pending),
            "SOLD" => Ok(ListingStatus::Sold),
            other => Err(MarketError::Serialization(format!("Invalid listing status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: AgentId,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub asset: String,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(seller_id: AgentId, title: String, description: String, price: Decimal, asset: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seller_id,
            title,
            description,
            price,
            asset,
            status: ListingStatus::Available,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(MarketError::InvalidParams("Listing title cannot be empty".to_string()));
        }
        if self.price <= Decimal::ZERO {
            return Err(MarketError::InvalidPrice("Price must be greater than 0".to_string()));
        }
        if self.asset.trim().is_empty() {
            return Err(MarketError::InvalidParams("Listing asset cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "CONFIRMED" => Ok(TransactionStatus::Confirmed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(MarketError::Serialization(format!(
                "Invalid transaction status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub buyer_address: String,
    pub seller_address: String,
    pub listing_id: ListingId,
    pub amount: Decimal,
    pub asset: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub status: TransactionStatus,
    pub settlement_ref: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const PLACEHOLDER_PREFIX: &str = "pending:";

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        buyer: &Agent,
        buyer_address: String,
        seller_address: String,
        listing: &Listing,
        asset: String,
        source_chain: String,
        destination_chain: String,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            buyer_id: buyer.id,
            seller_id: listing.seller_id,
            buyer_address,
            seller_address,
            listing_id: listing.id,
            amount: listing.price,
            asset,
            source_chain,
            destination_chain,
            status: TransactionStatus::Pending,
            settlement_ref: format!("{}{}", PLACEHOLDER_PREFIX, id),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True while no provider reference has been recorded.
    pub fn has_placeholder_ref(&self) -> bool {
        self.settlement_ref.starts_with(PLACEHOLDER_PREFIX)
    }
}

/// A signed attestation carried on an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub signature: String,
    pub policy_hash: String,
    pub signer_id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofKind {
    Request,
    Intent,
}

impl ProofKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Request => "REQUEST",
            ProofKind::Intent => "INTENT",
        }
    }
}

impl FromStr for ProofKind {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REQUEST" => Ok(ProofKind::Request),
            "INTENT" => Ok(ProofKind::Intent),
            other => Err(MarketError::Serialization(format!("Invalid proof kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProof {
    pub id: Uuid,
    pub kind: ProofKind,
    pub agent_id: AgentId,
    pub method: String,
    pub proof: Proof,
    pub transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

impl StoredProof {
    pub fn new(kind: ProofKind, agent_id: AgentId, method: &str, proof: Proof) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            agent_id,
            method: method.to_string(),
            proof,
            transaction_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn linked_to(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }
}
