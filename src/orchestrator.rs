use crate::{
    config::SettlementConfig,
    database::{Database, SettlementApplied, StoreTx},
    envelope::Method,
    model::*,
    settlement::{SettlementProvider, SettlementUpdate, TransferRequest, TransferStatus},
    wallet::{SignRequest, TypedData, WalletService},
    AgentId, ListingId, MarketError, Result, TransactionId,
};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub source_chain: String,
    pub settlement_timeout: std::time::Duration,
    pub reconcile_min_age: Duration,
    pub abandon_after: Duration,
}

impl From<&SettlementConfig> for OrchestratorConfig {
    fn from(config: &SettlementConfig) -> Self {
        Self {
            source_chain: config.source_chain.clone(),
            settlement_timeout: config.timeout(),
            reconcile_min_age: Duration::seconds(config.reconcile_min_age_seconds as i64),
            abandon_after: Duration::seconds(config.abandon_after_seconds as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub buyer_id: AgentId,
    pub listing_id: ListingId,
    pub destination_chain: Option<String>,
    /// The caller's authenticated request proof, kept with the transaction.
    pub request_proof: Proof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub transaction_id: TransactionId,
    pub settlement_ref: String,
    pub status: TransactionStatus,
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub still_pending: usize,
}

/// A committed pending transaction awaiting settlement.
#[derive(Debug, Clone)]
struct Reservation {
    transaction: Transaction,
    max_fee: Decimal,
}

/// Runs purchases as a saga: a local store transaction, then the external
/// transfer, then reconciliation of the provider's verdict.
pub struct PurchaseOrchestrator {
    db: Database,
    wallet: Arc<dyn WalletService>,
    settlement: Arc<dyn SettlementProvider>,
    config: OrchestratorConfig,
}

impl PurchaseOrchestrator {
    pub fn new(
        db: Database,
        wallet: Arc<dyn WalletService>,
        settlement: Arc<dyn SettlementProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            wallet,
            settlement,
            config,
        }
    }

    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt> {
        let reservation = self.reserve(&request).await?;
        tracing::info!(
            transaction_id = %reservation.transaction.id,
            buyer_id = %reservation.transaction.buyer_id,
            listing_id = %reservation.transaction.listing_id,
            amount = %reservation.transaction.amount,
            "Purchase recorded; submitting settlement"
        );
        self.settle(reservation).await
    }

    /// Local phase. Everything either commits together or not at all.
    async fn reserve(&self, request: &PurchaseRequest) -> Result<Reservation> {
        let mut tx = self.db.begin().await?;
        tx.lock_listing(request.listing_id).await?;

        let listing = tx
            .get_listing(request.listing_id)
            .await?
            .ok_or(MarketError::ListingNotFound(request.listing_id))?;
        let buyer = tx
            .get_agent(request.buyer_id)
            .await?
            .ok_or(MarketError::AgentNotFound(request.buyer_id))?;

        if listing.seller_id == buyer.id {
            return Err(MarketError::PolicyViolation(
                "Agents cannot purchase their own listings".to_string(),
            ));
        }

        if let Some(existing) = tx.find_pending_transaction(buyer.id, listing.id).await? {
            return Err(MarketError::DuplicatePurchase {
                transaction_id: Some(existing.id),
            });
        }

        if listing.status != ListingStatus::Available {
            return Err(MarketError::ListingUnavailable {
                listing_id: listing.id,
                status: listing.status,
            });
        }

        // The listing only moves to PENDING once the bridge accepts the
        // transfer, so another buyer's in-flight row also reserves it.
        if tx.find_pending_for_listing(listing.id).await?.is_some() {
            return Err(MarketError::ListingUnavailable {
                listing_id: listing.id,
                status: ListingStatus::Pending,
            });
        }

        let seller = tx
            .get_agent(listing.seller_id)
            .await?
            .ok_or(MarketError::AgentNotFound(listing.seller_id))?;
        let buyer_address = self.resolve_address(&mut tx, &buyer).await?;
        let seller_address = self.resolve_address(&mut tx, &seller).await?;

        let start_of_day = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let spent_today = tx.spent_since(buyer.id, start_of_day).await?;
        buyer.policy.check_spend(&SpendCheck {
            amount: listing.price,
            asset: &listing.asset,
            counterparty: &seller_address,
            spent_today,
        })?;

        let transaction = Transaction::pending(
            &buyer,
            buyer_address,
            seller_address,
            &listing,
            listing.asset.clone(),
            self.config.source_chain.clone(),
            request
                .destination_chain
                .clone()
                .unwrap_or_else(|| self.config.source_chain.clone()),
        );
        let intent = self.sign_intent(&buyer, &transaction).await?;

        tx.insert_transaction(&transaction).await?;
        tx.insert_proof(
            &StoredProof::new(ProofKind::Intent, buyer.id, Method::Purchase.as_str(), intent)
                .linked_to(transaction.id),
        )
        .await?;
        tx.insert_proof(
            &StoredProof::new(
                ProofKind::Request,
                buyer.id,
                Method::Purchase.as_str(),
                request.request_proof.clone(),
            )
            .linked_to(transaction.id),
        )
        .await?;
        tx.commit().await?;

        Ok(Reservation {
            transaction,
            max_fee: buyer.policy.max_gas_price,
        })
    }

    async fn resolve_address(&self, tx: &mut StoreTx, agent: &Agent) -> Result<String> {
        if let Some(address) = &agent.wallet_address {
            return Ok(address.clone());
        }
        let address = self.wallet.get_address(agent.id).await?;
        tx.set_wallet_address(agent.id, &address).await?;
        Ok(address)
    }

    async fn sign_intent(&self, buyer: &Agent, transaction: &Transaction) -> Result<Proof> {
        let timestamp = Utc::now().timestamp_millis();
        let typed_data = TypedData {
            domain: "agentmarket".to_string(),
            primary_type: "PurchaseIntent".to_string(),
            message: json!({
                "listingId": transaction.listing_id,
                "buyer": transaction.buyer_address,
                "amount": transaction.amount.to_string(),
                "timestamp": timestamp,
            }),
        };

        let signature = self
            .wallet
            .sign_typed_data(&SignRequest {
                agent_id: buyer.id,
                typed_data,
            })
            .await?;

        Ok(Proof {
            signature,
            policy_hash: buyer.policy.hash()?,
            signer_id: transaction.buyer_address.clone(),
            timestamp,
        })
    }

    /// External phase. The transaction id doubles as the idempotency key.
    async fn settle(&self, reservation: Reservation) -> Result<PurchaseReceipt> {
        let Reservation { transaction, max_fee } = reservation;
        let transfer = TransferRequest {
            transaction_id: transaction.id,
            from: transaction.buyer_address.clone(),
            to: transaction.seller_address.clone(),
            amount: transaction.amount,
            asset: transaction.asset.clone(),
            source_chain: transaction.source_chain.clone(),
            destination_chain: transaction.destination_chain.clone(),
            max_fee,
        };

        let outcome = match tokio::time::timeout(
            self.config.settlement_timeout,
            self.settlement.execute_transfer(&transfer),
        )
        .await
        {
            Err(_) => {
                tracing::warn!(transaction_id = %transaction.id, "Settlement timed out; leaving transaction pending");
                return Err(MarketError::SettlementTimeout {
                    transaction_id: transaction.id,
                });
            }
            Ok(Err(e)) => {
                tracing::error!(transaction_id = %transaction.id, error = %e, "Settlement provider call failed");
                return self.fail(transaction.id, "Settlement provider unavailable").await;
            }
            Ok(Ok(outcome)) => outcome,
        };

        let settlement_ref = match (outcome.status, outcome.settlement_ref) {
            (TransferStatus::Success, Some(settlement_ref)) => settlement_ref,
            (TransferStatus::Success, None) => {
                return self.fail(transaction.id, "Settlement returned no reference").await;
            }
            (TransferStatus::Failed, _) => {
                let reason = outcome.error.unwrap_or_else(|| "Transfer rejected".to_string());
                return self.fail(transaction.id, &reason).await;
            }
        };

        if !self.db.record_submission(transaction.id, &settlement_ref).await? {
            tracing::warn!(transaction_id = %transaction.id, "Transaction resolved before its submission was recorded");
        }

        let mut status = TransactionStatus::Pending;
        if outcome.settlement_status.is_terminal() {
            let update = SettlementUpdate {
                settlement_ref: settlement_ref.clone(),
                status: outcome.settlement_status,
                error: outcome.error,
            };
            if let Some(applied) = self.apply_settlement_update(&update).await? {
                status = applied;
            }
        }

        tracing::info!(transaction_id = %transaction.id, %settlement_ref, %status, "Settlement submitted");
        Ok(PurchaseReceipt {
            transaction_id: transaction.id,
            settlement_ref,
            status,
            explorer_url: outcome.explorer_url,
        })
    }

    async fn fail<T>(&self, transaction_id: TransactionId, reason: &str) -> Result<T> {
        self.db.mark_failed(transaction_id, reason).await?;
        Err(MarketError::Settlement {
            transaction_id,
            reason: reason.to_string(),
        })
    }

    /// Applies a terminal status reported by the provider. Returns the
    /// transaction's resulting status, or `None` for unknown references
    /// and non-terminal updates.
    pub async fn apply_settlement_update(&self, update: &SettlementUpdate) -> Result<Option<TransactionStatus>> {
        if !update.status.is_terminal() {
            tracing::debug!(settlement_ref = %update.settlement_ref, "Ignoring non-terminal settlement update");
            return Ok(None);
        }

        let applied = self
            .db
            .apply_settlement(&update.settlement_ref, update.status, update.error.as_deref())
            .await?;

        Ok(match applied {
            None => {
                tracing::warn!(settlement_ref = %update.settlement_ref, "Settlement update for unknown reference");
                None
            }
            Some(SettlementApplied::Confirmed(transaction)) => {
                tracing::info!(transaction_id = %transaction.id, listing_id = %transaction.listing_id, "Transaction confirmed");
                Some(TransactionStatus::Confirmed)
            }
            Some(SettlementApplied::Failed(transaction)) => {
                tracing::warn!(transaction_id = %transaction.id, error = ?update.error, "Transaction failed at settlement");
                Some(TransactionStatus::Failed)
            }
            Some(SettlementApplied::AlreadyTerminal(transaction)) => {
                tracing::debug!(transaction_id = %transaction.id, status = %transaction.status, "Ignoring update for settled transaction");
                Some(transaction.status)
            }
        })
    }

    /// Sweeps pending transactions older than the minimum age, asking the
    /// provider what became of each.
    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for transaction in self
            .db
            .list_pending_transactions(now - self.config.reconcile_min_age)
            .await?
        {
            report.examined += 1;

            let outcome = match self.settlement.transfer_status(transaction.id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(transaction_id = %transaction.id, error = %e, "Settlement status lookup failed");
                    report.still_pending += 1;
                    continue;
                }
            };

            let Some(outcome) = outcome else {
                if now - transaction.created_at >= self.config.abandon_after {
                    let reason = "Settlement provider has no record of this transfer";
                    if transaction.has_placeholder_ref() {
                        self.db.mark_failed(transaction.id, reason).await?;
                    } else {
                        self.db
                            .apply_settlement(&transaction.settlement_ref, TransactionStatus::Failed, Some(reason))
                            .await?;
                    }
                    tracing::warn!(transaction_id = %transaction.id, "Abandoned unsubmitted transaction");
                    report.abandoned += 1;
                } else {
                    report.still_pending += 1;
                }
                continue;
            };

            let settlement_ref = match (outcome.status, outcome.settlement_ref) {
                (TransferStatus::Success, Some(settlement_ref)) => settlement_ref,
                (status, _) => {
                    let reason = outcome
                        .error
                        .unwrap_or_else(|| format!("Transfer ended with status {:?}", status));
                    if transaction.has_placeholder_ref() {
                        self.db.mark_failed(transaction.id, &reason).await?;
                    } else {
                        self.db
                            .apply_settlement(&transaction.settlement_ref, TransactionStatus::Failed, Some(&reason))
                            .await?;
                    }
                    report.failed += 1;
                    continue;
                }
            };

            if transaction.has_placeholder_ref() {
                self.db.record_submission(transaction.id, &settlement_ref).await?;
            }

            if !outcome.settlement_status.is_terminal() {
                report.still_pending += 1;
                continue;
            }

            let update = SettlementUpdate {
                settlement_ref,
                status: outcome.settlement_status,
                error: outcome.error,
            };
            match self.apply_settlement_update(&update).await? {
                Some(TransactionStatus::Confirmed) => report.confirmed += 1,
                Some(TransactionStatus::Failed) => report.failed += 1,
                _ => report.still_pending += 1,
            }
        }

        if report.examined > 0 {
            tracing::info!(?report, "Reconciled pending transactions");
        }
        Ok(report)
    }

    pub fn spawn_update_listener(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<SettlementUpdate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if let Err(e) = self.apply_settlement_update(&update).await {
                    tracing::error!(settlement_ref = %update.settlement_ref, error = %e, "Failed to apply settlement update");
                }
            }
            tracing::debug!("Settlement update channel closed");
        })
    }

    pub fn spawn_reconciler(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile_pending(Utc::now()).await {
                    tracing::error!(error = %e, "Reconciliation sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{MockSettlementProvider, TransferOutcome};
    use crate::wallet::LocalWallet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        db: Database,
        buyer: Agent,
        listing: Listing,
        _dir: TempDir,
    }

    async fn fixture(price: Decimal) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&format!("sqlite://{}", dir.path().join("orch.db").display()))
            .await
            .unwrap();

        let buyer = Agent::new(Uuid::new_v4(), "buyer".into(), AgentRole::Buyer, "11".repeat(32), Policy::default());
        let seller = Agent::new(Uuid::new_v4(), "seller".into(), AgentRole::Seller, "22".repeat(32), Policy::default());
        db.create_agent(&buyer).await.unwrap();
        db.create_agent(&seller).await.unwrap();

        let listing = Listing::new(seller.id, "Desk".into(), "Oak".into(), price, "USDC".into());
        db.create_listing(&listing).await.unwrap();

        Fixture { db, buyer, listing, _dir: dir }
    }

    fn orchestrator(db: &Database, settlement: MockSettlementProvider) -> PurchaseOrchestrator {
        PurchaseOrchestrator::new(
            db.clone(),
            Arc::new(LocalWallet::new([5u8; 32])),
            Arc::new(settlement),
            OrchestratorConfig::from(&SettlementConfig::default()),
        )
    }

    fn purchase_request(fixture: &Fixture) -> PurchaseRequest {
        PurchaseRequest {
            buyer_id: fixture.buyer.id,
            listing_id: fixture.listing.id,
            destination_chain: None,
            request_proof: Proof {
                signature: "c2ln".into(),
                policy_hash: "hash".into(),
                signer_id: "0xbuyer".into(),
                timestamp: Utc::now().timestamp_millis(),
            },
        }
    }

    #[tokio::test]
    async fn test_policy_violation_never_reaches_settlement() {
        let fixture = fixture(dec!(150)).await;
        let mut settlement = MockSettlementProvider::new();
        settlement.expect_execute_transfer().times(0);
        let orchestrator = orchestrator(&fixture.db, settlement);

        let err = orchestrator.purchase(purchase_request(&fixture)).await.unwrap_err();
        assert!(matches!(err, MarketError::PolicyViolation(_)));

        let report = orchestrator.reconcile_pending(Utc::now() + Duration::days(1)).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_transport_error_compensates() {
        let fixture = fixture(dec!(40)).await;
        let mut settlement = MockSettlementProvider::new();
        settlement
            .expect_execute_transfer()
            .times(1)
            .returning(|_| Err(MarketError::Internal("connection reset".into())));
        let orchestrator = orchestrator(&fixture.db, settlement);

        let err = orchestrator.purchase(purchase_request(&fixture)).await.unwrap_err();
        let transaction_id = match err {
            MarketError::Settlement { transaction_id, .. } => transaction_id,
            other => panic!("expected settlement error, got {:?}", other),
        };

        let stored = fixture.db.get_transaction(transaction_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert!(stored.error.is_some());
        assert_eq!(
            fixture.db.get_listing(fixture.listing.id).await.unwrap().unwrap().status,
            ListingStatus::Available
        );

        let proofs = fixture.db.get_proofs_for_transaction(transaction_id).await.unwrap();
        assert_eq!(proofs.len(), 2);
    }

    #[tokio::test]
    async fn test_success_without_reference_is_a_failure() {
        let fixture = fixture(dec!(40)).await;
        let mut settlement = MockSettlementProvider::new();
        settlement.expect_execute_transfer().returning(|_| {
            Ok(TransferOutcome {
                status: TransferStatus::Success,
                settlement_ref: None,
                settlement_status: TransactionStatus::Pending,
                explorer_url: None,
                error: None,
            })
        });
        let orchestrator = orchestrator(&fixture.db, settlement);

        let err = orchestrator.purchase(purchase_request(&fixture)).await.unwrap_err();
        assert!(matches!(err, MarketError::Settlement { .. }));
    }

    #[tokio::test]
    async fn test_sweep_learns_reference_and_confirms() {
        let fixture = fixture(dec!(40)).await;
        let mut settlement = MockSettlementProvider::new();
        settlement.expect_execute_transfer().returning(|_| Err(MarketError::Internal("down".into())));
        settlement.expect_transfer_status().returning(|_| {
            Ok(Some(TransferOutcome {
                status: TransferStatus::Success,
                settlement_ref: Some("0xlate".into()),
                settlement_status: TransactionStatus::Confirmed,
                explorer_url: None,
                error: None,
            }))
        });
        let orchestrator = orchestrator(&fixture.db, settlement);

        // Leave a pending row behind the way a timed-out call would.
        let transaction = orchestrator.reserve(&purchase_request(&fixture)).await.unwrap().transaction;
        assert!(transaction.has_placeholder_ref());

        let report = orchestrator
            .reconcile_pending(Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(report.confirmed, 1);

        let stored = fixture.db.get_transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Confirmed);
        assert_eq!(stored.settlement_ref, "0xlate");
        assert_eq!(
            fixture.db.get_listing(fixture.listing.id).await.unwrap().unwrap().status,
            ListingStatus::Sold
        );
    }

    #[tokio::test]
    async fn test_sweep_abandons_unknown_transfers() {
        let fixture = fixture(dec!(40)).await;
        let mut settlement = MockSettlementProvider::new();
        settlement.expect_transfer_status().returning(|_| Ok(None));
        let orchestrator = orchestrator(&fixture.db, settlement);

        let transaction = orchestrator.reserve(&purchase_request(&fixture)).await.unwrap().transaction;

        let early = orchestrator.reconcile_pending(Utc::now() + Duration::minutes(5)).await.unwrap();
        assert_eq!(early.still_pending, 1);

        let late = orchestrator.reconcile_pending(Utc::now() + Duration::hours(2)).await.unwrap();
        assert_eq!(late.abandoned, 1);
        assert_eq!(
            fixture.db.get_transaction(transaction.id).await.unwrap().unwrap().status,
            TransactionStatus::Failed
        );
    }

    /// Confirms every transfer after a delay.
    #[derive(Default)]
    struct SlowBridge {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SettlementProvider for SlowBridge {
        async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            Ok(TransferOutcome {
                status: TransferStatus::Success,
                settlement_ref: Some(format!("0x{}", request.transaction_id.simple())),
                settlement_status: TransactionStatus::Confirmed,
                explorer_url: None,
                error: None,
            })
        }

        async fn transfer_status(&self, _transaction_id: TransactionId) -> Result<Option<TransferOutcome>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_in_flight_transfer_blocks_other_buyers() {
        let fixture = fixture(dec!(40)).await;
        let rival = Agent::new(Uuid::new_v4(), "rival".into(), AgentRole::Buyer, "33".repeat(32), Policy::default());
        fixture.db.create_agent(&rival).await.unwrap();

        let bridge = Arc::new(SlowBridge::default());
        let orchestrator = PurchaseOrchestrator::new(
            fixture.db.clone(),
            Arc::new(LocalWallet::new([5u8; 32])),
            bridge.clone(),
            OrchestratorConfig::from(&SettlementConfig::default()),
        );

        let mut rival_request = purchase_request(&fixture);
        rival_request.buyer_id = rival.id;
        let (first, second) = tokio::join!(
            orchestrator.purchase(purchase_request(&fixture)),
            orchestrator.purchase(rival_request)
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(MarketError::ListingUnavailable { .. }))));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fixture.db.get_listing(fixture.listing.id).await.unwrap().unwrap().status,
            ListingStatus::Sold
        );
    }

    #[tokio::test]
    async fn test_buyer_cannot_buy_own_listing() {
        let fixture = fixture(dec!(40)).await;
        let orchestrator = orchestrator(&fixture.db, MockSettlementProvider::new());
        let mut request = purchase_request(&fixture);
        request.buyer_id = fixture.listing.seller_id;

        assert!(matches!(
            orchestrator.purchase(request).await,
            Err(MarketError::PolicyViolation(_))
        ));
    }
}
