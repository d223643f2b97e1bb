use crate::{
    config::{SettlementConfig, SettlementProviderKind},
    model::TransactionStatus,
    MarketError, Result, TransactionId,
};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-settlement-signature";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Also the idempotency key: resubmitting the same id never moves
    /// funds twice.
    pub transaction_id: TransactionId,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub asset: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub max_fee: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub status: TransferStatus,
    #[serde(default)]
    pub settlement_ref: Option<String>,
    pub settlement_status: TransactionStatus,
    #[serde(default)]
    pub explorer_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TransferStatus::Failed,
            settlement_ref: None,
            settlement_status: TransactionStatus::Failed,
            explorer_url: None,
            error: Some(reason.into()),
        }
    }
}

/// Asynchronous status report from the provider, keyed by its reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementUpdate {
    pub settlement_ref: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementProvider: Send + Sync {
    async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferOutcome>;

    /// What the provider knows about a transfer submitted under this
    /// transaction id, or `None` if it never saw one.
    async fn transfer_status(&self, transaction_id: TransactionId) -> Result<Option<TransferOutcome>>;
}

pub fn callback_channel() -> (mpsc::UnboundedSender<SettlementUpdate>, mpsc::UnboundedReceiver<SettlementUpdate>) {
    mpsc::unbounded_channel()
}

pub fn build_provider(
    config: &SettlementConfig,
    updates: mpsc::UnboundedSender<SettlementUpdate>,
) -> Result<Arc<dyn SettlementProvider>> {
    match config.provider {
        SettlementProviderKind::Mock => {
            let mut bridge = MockBridge::new(MockBehavior::Pending).with_updates(updates);
            if let Some(seconds) = config.mock_finality_seconds {
                bridge = bridge.with_finality(Duration::from_secs(seconds));
            }
            Ok(Arc::new(bridge))
        }
        SettlementProviderKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| MarketError::Config("Settlement endpoint is not configured".to_string()))?;
            Ok(Arc::new(HttpSettlementProvider::new(endpoint, config.timeout())?))
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

pub fn sign_callback(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Constant-time check of a hex HMAC-SHA256 over the raw callback body.
pub fn verify_callback_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let expected = match hex::decode(signature_hex.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        Err(_) => false,
    }
}

/// Provider client for a bridge service speaking JSON over HTTP.
pub struct HttpSettlementProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSettlementProvider {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SettlementProvider for HttpSettlementProvider {
    async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let url = format!("{}/transfers", self.endpoint);
        tracing::debug!(transaction_id = %request.transaction_id, %url, "Submitting transfer");

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", request.transaction_id.to_string())
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<TransferOutcome>().await?)
    }

    async fn transfer_status(&self, transaction_id: TransactionId) -> Result<Option<TransferOutcome>> {
        let url = format!("{}/transfers/{}", self.endpoint, transaction_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(response.error_for_status()?.json::<TransferOutcome>().await?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Accept and report finality later, if finality is configured.
    Pending,
    /// Accept and report confirmation in the same call.
    Confirm,
    /// Refuse the transfer.
    Fail,
    /// Never answer.
    Hang,
}

/// In-process bridge for development and tests.
pub struct MockBridge {
    behavior: RwLock<MockBehavior>,
    fee: Decimal,
    transfers: Arc<Mutex<HashMap<TransactionId, TransferOutcome>>>,
    updates: Option<mpsc::UnboundedSender<SettlementUpdate>>,
    finality: Option<Duration>,
    calls: AtomicUsize,
}

impl MockBridge {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            fee: dec!(0.01),
            transfers: Arc::new(Mutex::new(HashMap::new())),
            updates: None,
            finality: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<SettlementUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn with_finality(mut self, delay: Duration) -> Self {
        self.finality = Some(delay);
        self
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.write() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Moves a submitted transfer to its final state, as the chain would.
    pub fn finalize(&self, transaction_id: TransactionId, status: TransactionStatus) -> Option<SettlementUpdate> {
        finalize_transfer(&self.transfers, transaction_id, status)
    }

    fn schedule_finality(&self, transaction_id: TransactionId) {
        let (Some(updates), Some(delay)) = (self.updates.clone(), self.finality) else {
            return;
        };
        let transfers = Arc::clone(&self.transfers);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(update) = finalize_transfer(&transfers, transaction_id, TransactionStatus::Confirmed) {
                tracing::info!(%transaction_id, settlement_ref = %update.settlement_ref, "Mock bridge reached finality");
                let _ = updates.send(update);
            }
        });
    }
}

fn finalize_transfer(
    transfers: &Mutex<HashMap<TransactionId, TransferOutcome>>,
    transaction_id: TransactionId,
    status: TransactionStatus,
) -> Option<SettlementUpdate> {
    let mut transfers = transfers.lock();
    let outcome = transfers.get_mut(&transaction_id)?;
    if outcome.settlement_status.is_terminal() {
        return None;
    }
    let settlement_ref = outcome.settlement_ref.clone()?;
    outcome.settlement_status = status;
    Some(SettlementUpdate {
        settlement_ref,
        status,
        error: None,
    })
}

enum Submission {
    Known(TransferOutcome),
    Recorded(TransferOutcome),
    Unanswered,
}

impl MockBridge {
    /// Looks up and records under one lock so concurrent resubmissions of
    /// the same id observe a single transfer.
    fn submit(&self, request: &TransferRequest) -> Submission {
        let mut transfers = self.transfers.lock();
        if let Some(existing) = transfers.get(&request.transaction_id) {
            return Submission::Known(existing.clone());
        }

        let behavior = *self.behavior.read();
        let outcome = match behavior {
            MockBehavior::Hang => return Submission::Unanswered,
            MockBehavior::Fail => TransferOutcome::failed("transfer rejected by bridge"),
            _ if self.fee > request.max_fee => {
                TransferOutcome::failed(format!("fee {} exceeds cap {}", self.fee, request.max_fee))
            }
            MockBehavior::Confirm | MockBehavior::Pending => {
                let settlement_ref = format!("0x{}", Uuid::new_v4().simple());
                TransferOutcome {
                    status: TransferStatus::Success,
                    explorer_url: Some(format!("https://explorer.mock/{}/tx/{}", request.source_chain, settlement_ref)),
                    settlement_ref: Some(settlement_ref),
                    settlement_status: if behavior == MockBehavior::Confirm {
                        TransactionStatus::Confirmed
                    } else {
                        TransactionStatus::Pending
                    },
                    error: None,
                }
            }
        };

        transfers.insert(request.transaction_id, outcome.clone());
        Submission::Recorded(outcome)
    }
}

#[async_trait]
impl SettlementProvider for MockBridge {
    async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = match self.submit(request) {
            Submission::Known(existing) => return Ok(existing),
            Submission::Unanswered => return std::future::pending().await,
            Submission::Recorded(outcome) => outcome,
        };

        tracing::info!(
            transaction_id = %request.transaction_id,
            amount = %request.amount,
            asset = %request.asset,
            status = ?outcome.status,
            "Mock bridge transfer"
        );

        if outcome.status == TransferStatus::Success && outcome.settlement_status == TransactionStatus::Pending {
            self.schedule_finality(request.transaction_id);
        }
        Ok(outcome)
    }

    async fn transfer_status(&self, transaction_id: TransactionId) -> Result<Option<TransferOutcome>> {
        Ok(self.transfers.lock().get(&transaction_id).cloned())
    }
}
