use agentmarket::{
    client::AgentClient,
    config::AppConfig,
    database::Database,
    envelope::{codes, Method, Params, Request, Response},
    error::Result,
    model::{ListingStatus, TransactionStatus},
    server::{self, AppState},
    settlement::{MockBehavior, MockBridge},
    wallet::LocalWallet,
    ListingId, TransactionId,
};
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    state: AppState,
    db: Database,
    bridge: Arc<MockBridge>,
    _dir: TempDir,
}

impl Harness {
    async fn new(behavior: MockBehavior) -> Result<Self> {
        let dir = TempDir::new()?;
        let db = Database::new(&format!("sqlite://{}", dir.path().join("market.db").display())).await?;
        let wallet = Arc::new(LocalWallet::new([42u8; 32]));
        let bridge = Arc::new(MockBridge::new(behavior));

        let mut config = AppConfig::default();
        config.settlement.timeout_seconds = 1;

        let state = server::build_state(db.clone(), wallet, bridge.clone(), &config);
        Ok(Self {
            state,
            db,
            bridge,
            _dir: dir,
        })
    }

    async fn send(&self, request: &Request) -> Response {
        self.state
            .dispatcher
            .handle_message(serde_json::to_value(request).unwrap())
            .await
    }

    async fn call(&self, client: &AgentClient, method: Method, params: Value) -> Response {
        self.send(&client.build_request(method, to_params(params))).await
    }

    async fn register(&self, name: &str, role: &str, policy: Option<Value>) -> AgentClient {
        let client = AgentClient::new("http://marketplace.test", Uuid::new_v4(), SigningKey::generate(&mut OsRng)).unwrap();
        let mut params = json!({
            "agentId": client.agent_id(),
            "name": name,
            "role": role,
            "publicKey": client.public_key_hex(),
        });
        if let Some(policy) = policy {
            params["policy"] = policy;
        }

        let response = self.call(&client, Method::RegisterAgent, params).await;
        assert!(response.error.is_none(), "registration failed: {:?}", response.error);
        client
    }

    async fn list(&self, seller: &AgentClient, title: &str, price: &str) -> ListingId {
        let response = self
            .call(seller, Method::CreateListing, json!({"title": title, "price": price}))
            .await;
        let listing = response.result.expect("listing created");
        Uuid::parse_str(listing["id"].as_str().unwrap()).unwrap()
    }

    async fn purchase(&self, buyer: &AgentClient, listing_id: ListingId) -> Response {
        self.call(buyer, Method::Purchase, json!({"listingId": listing_id})).await
    }

    async fn listing_status(&self, listing_id: ListingId) -> ListingStatus {
        self.db.get_listing(listing_id).await.unwrap().unwrap().status
    }

    async fn transaction_status(&self, transaction_id: TransactionId) -> TransactionStatus {
        self.db.get_transaction(transaction_id).await.unwrap().unwrap().status
    }
}

fn to_params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn transaction_id(value: &Value) -> TransactionId {
    Uuid::parse_str(value["transactionId"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_invalid_envelope_has_null_id() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;

    let response = harness
        .state
        .dispatcher
        .handle_message(json!({"version": "2.0", "method": "marketplace.steal", "id": 5}))
        .await;

    assert_eq!(response.error_code(), Some(codes::INVALID_REQUEST));
    assert_eq!(serde_json::to_value(&response)?["id"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn test_search_needs_no_proof() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("lamps", "SELLER", None).await;
    let buyer = harness.register("shopper", "BUYER", None).await;
    harness.list(&seller, "Brass desk lamp", "35").await;
    harness.list(&seller, "Floor rug", "20").await;

    let response = harness.call(&buyer, Method::Search, json!({"query": "lamp"})).await;
    let result = response.result.expect("search result");

    assert_eq!(result["count"], 1);
    assert_eq!(result["listings"][0]["title"], "Brass desk lamp");
    Ok(())
}

#[tokio::test]
async fn test_authenticated_methods_reject_missing_and_stale_proofs() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Chair", "50").await;

    let params = to_params(json!({
        "agentId": buyer.agent_id().to_string(),
        "listingId": listing_id,
        "offerPrice": "45",
    }));

    let unsigned = Request::new(Method::Offer, params.clone(), None);
    assert_eq!(harness.send(&unsigned).await.error_code(), Some(codes::UNAUTHORIZED));

    let stale_at = (Utc::now() - Duration::minutes(11)).timestamp_millis();
    let stale = Request::new(Method::Offer, params.clone(), None)
        .with_proof(buyer.sign(Method::Offer, &params, stale_at));
    assert_eq!(harness.send(&stale).await.error_code(), Some(codes::UNAUTHORIZED));

    let forged = Request::new(Method::Offer, params.clone(), None)
        .with_proof(seller.sign(Method::Offer, &params, Utc::now().timestamp_millis()));
    assert_eq!(harness.send(&forged).await.error_code(), Some(codes::UNAUTHORIZED));
    Ok(())
}

#[tokio::test]
async fn test_proof_on_public_method_is_still_verified() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let buyer = harness.register("buyer", "BUYER", None).await;

    let params = to_params(json!({"agentId": buyer.agent_id().to_string(), "query": "x"}));
    let mut proof = buyer.sign(Method::Search, &params, Utc::now().timestamp_millis());
    let valid = Request::new(Method::Search, params.clone(), None).with_proof(proof.clone());
    assert!(harness.send(&valid).await.error.is_none());

    proof.signature = "AAAA".to_string();
    let tampered = Request::new(Method::Search, params, None).with_proof(proof);
    assert_eq!(harness.send(&tampered).await.error_code(), Some(codes::UNAUTHORIZED));
    Ok(())
}

#[tokio::test]
async fn test_offer_decisions() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Bike", "100").await;

    let offer = |price: &'static str| {
        let buyer = &buyer;
        let harness = &harness;
        async move {
            harness
                .call(buyer, Method::Offer, json!({"listingId": listing_id, "offerPrice": price}))
                .await
        }
    };

    let accept = offer("90").await.result.expect("accepted");
    assert_eq!(accept["decision"], "ACCEPT");

    let counter = offer("75").await.result.expect("countered");
    assert_eq!(counter["decision"], "COUNTER");
    assert_eq!(counter["counterPrice"], "90");

    let reject = offer("74.99").await.error.expect("rejected");
    assert_eq!(reject.code, codes::OFFER_REJECTED);
    assert_eq!(reject.data.unwrap()["decision"], "REJECT");

    assert_eq!(offer("0").await.error_code(), Some(codes::INVALID_PRICE));
    Ok(())
}

#[tokio::test]
async fn test_registering_an_id_twice_is_invalid() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let agent = harness.register("seller", "SELLER", None).await;

    let params = json!({
        "agentId": agent.agent_id(),
        "name": "again",
        "role": "SELLER",
        "publicKey": agent.public_key_hex(),
    });
    let response = harness.call(&agent, Method::RegisterAgent, params).await;
    assert_eq!(response.error_code(), Some(codes::INVALID_PARAMS));
    Ok(())
}

#[tokio::test]
async fn test_buyers_cannot_create_listings() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let buyer = harness.register("buyer", "BUYER", None).await;

    let response = harness
        .call(&buyer, Method::CreateListing, json!({"title": "Nope", "price": "5"}))
        .await;
    assert_eq!(response.error_code(), Some(codes::UNAUTHORIZED));
    Ok(())
}

#[tokio::test]
async fn test_policy_violation_leaves_no_trace() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Sofa", "150").await;

    let response = harness.purchase(&buyer, listing_id).await;

    assert_eq!(response.error_code(), Some(codes::POLICY_VIOLATION));
    assert_eq!(harness.bridge.calls(), 0);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Available);

    let report = harness.state.orchestrator.reconcile_pending(Utc::now() + Duration::days(1)).await?;
    assert_eq!(report.examined, 0);
    Ok(())
}

#[tokio::test]
async fn test_daily_spending_limit() -> Result<()> {
    let harness = Harness::new(MockBehavior::Pending).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let policy = json!({
        "maxTransactionValue": "100",
        "dailySpendingLimit": "150",
        "maxGasPrice": "1",
        "allowedAssets": ["USDC"],
    });
    let buyer = harness.register("buyer", "BUYER", Some(policy)).await;
    let first = harness.list(&seller, "Tent", "100").await;
    let second = harness.list(&seller, "Stove", "60").await;

    assert!(harness.purchase(&buyer, first).await.error.is_none());

    let over = harness.purchase(&buyer, second).await;
    assert_eq!(over.error_code(), Some(codes::POLICY_VIOLATION));
    Ok(())
}

#[tokio::test]
async fn test_immediate_confirmation_sells_listing() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Kettle", "25").await;

    let receipt = harness.purchase(&buyer, listing_id).await.result.expect("purchase");
    assert_eq!(receipt["status"], "CONFIRMED");
    assert!(receipt["explorerUrl"].as_str().is_some());

    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Sold);
    let buyer_row = harness.db.get_agent(buyer.agent_id()).await?.unwrap();
    let seller_row = harness.db.get_agent(seller.agent_id()).await?.unwrap();
    assert_eq!(buyer_row.transaction_count, 1);
    assert_eq!(seller_row.transaction_count, 1);
    assert!(buyer_row.wallet_address.is_some());

    let lookup = harness
        .call(&buyer, Method::GetTransaction, json!({"transactionId": receipt["transactionId"]}))
        .await
        .result
        .expect("transaction");
    assert_eq!(lookup["transaction"]["status"], "CONFIRMED");
    assert_eq!(lookup["proofs"].as_array().unwrap().len(), 2);

    let again = harness.purchase(&buyer, listing_id).await;
    assert_eq!(again.error_code(), Some(codes::LISTING_NOT_FOUND));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_yield_one_pending_transaction() -> Result<()> {
    let harness = Arc::new(Harness::new(MockBehavior::Pending).await?);
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = Arc::new(harness.register("buyer", "BUYER", None).await);
    let listing_id = harness.list(&seller, "Camera", "80").await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let harness = Arc::clone(&harness);
        let buyer = Arc::clone(&buyer);
        tasks.push(tokio::spawn(async move { harness.purchase(&buyer, listing_id).await }));
    }

    let mut successes = 0;
    let mut duplicates = 0;
    for task in tasks {
        let response = task.await.unwrap();
        match response.error {
            None => successes += 1,
            Some(error) => {
                assert_eq!(error.code, codes::POLICY_VIOLATION);
                assert_eq!(error.data.unwrap()["reason"], "DUPLICATE_IN_PROGRESS");
                duplicates += 1;
            }
        }
    }

    assert_eq!((successes, duplicates), (1, 1));
    assert_eq!(harness.bridge.calls(), 1);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Pending);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_buyers_cannot_both_buy_one_listing() -> Result<()> {
    let harness = Arc::new(Harness::new(MockBehavior::Confirm).await?);
    let seller = harness.register("seller", "SELLER", None).await;
    let listing_id = harness.list(&seller, "Painting", "70").await;

    let mut tasks = Vec::new();
    for name in ["alice", "bob"] {
        let harness = Arc::clone(&harness);
        let buyer = harness.register(name, "BUYER", None).await;
        tasks.push(tokio::spawn(async move { harness.purchase(&buyer, listing_id).await }));
    }

    let mut confirmed = 0;
    let mut refused = 0;
    for task in tasks {
        let response = task.await.unwrap();
        match (response.result, response.error) {
            (Some(result), None) => {
                assert_eq!(result["status"], "CONFIRMED");
                confirmed += 1;
            }
            (_, Some(error)) => {
                assert_eq!(error.code, codes::LISTING_NOT_FOUND);
                refused += 1;
            }
            (None, None) => panic!("response carries neither result nor error"),
        }
    }

    assert_eq!((confirmed, refused), (1, 1));
    assert_eq!(harness.bridge.calls(), 1);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Sold);
    Ok(())
}

#[tokio::test]
async fn test_unsubmitted_purchase_still_reserves_listing() -> Result<()> {
    let harness = Harness::new(MockBehavior::Hang).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let first = harness.register("first", "BUYER", None).await;
    let second = harness.register("second", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Vase", "50").await;

    let error = harness.purchase(&first, listing_id).await.error.expect("timeout");
    assert_eq!(error.code, codes::SETTLEMENT_TIMEOUT);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Available);

    harness.bridge.set_behavior(MockBehavior::Confirm);
    let error = harness.purchase(&second, listing_id).await.error.expect("listing reserved");
    assert_eq!(error.code, codes::LISTING_NOT_FOUND);
    assert_eq!(error.data.unwrap()["status"], "PENDING");
    assert_eq!(harness.bridge.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_settlement_failure_compensates_and_allows_retry() -> Result<()> {
    let harness = Harness::new(MockBehavior::Fail).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Guitar", "90").await;

    let error = harness.purchase(&buyer, listing_id).await.error.expect("settlement failure");
    assert_eq!(error.code, codes::SETTLEMENT_FAILED);
    let failed_id = transaction_id(&error.data.unwrap());

    assert_eq!(harness.transaction_status(failed_id).await, TransactionStatus::Failed);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Available);

    harness.bridge.set_behavior(MockBehavior::Confirm);
    let retry = harness.purchase(&buyer, listing_id).await.result.expect("retry succeeds");
    assert_ne!(transaction_id(&retry), failed_id);
    assert_eq!(retry["status"], "CONFIRMED");
    Ok(())
}

#[tokio::test]
async fn test_settlement_timeout_is_resolved_by_sweep() -> Result<()> {
    let harness = Harness::new(MockBehavior::Hang).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Drone", "99").await;

    let error = harness.purchase(&buyer, listing_id).await.error.expect("timeout");
    assert_eq!(error.code, codes::SETTLEMENT_TIMEOUT);
    let pending_id = transaction_id(&error.data.unwrap());
    assert_eq!(harness.transaction_status(pending_id).await, TransactionStatus::Pending);

    // The bridge never recorded the transfer, so once the row is old
    // enough the sweep gives up on it.
    let report = harness
        .state
        .orchestrator
        .reconcile_pending(Utc::now() + Duration::hours(2))
        .await?;
    assert_eq!(report.abandoned, 1);
    assert_eq!(harness.transaction_status(pending_id).await, TransactionStatus::Failed);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Available);
    Ok(())
}

#[tokio::test]
async fn test_asynchronous_confirmation_is_applied_once() -> Result<()> {
    let harness = Harness::new(MockBehavior::Pending).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Telescope", "70").await;

    let receipt = harness.purchase(&buyer, listing_id).await.result.expect("purchase");
    assert_eq!(receipt["status"], "PENDING");
    let id = transaction_id(&receipt);
    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Pending);

    let update = harness
        .bridge
        .finalize(id, TransactionStatus::Confirmed)
        .expect("bridge knows the transfer");
    let orchestrator = &harness.state.orchestrator;
    assert_eq!(
        orchestrator.apply_settlement_update(&update).await?,
        Some(TransactionStatus::Confirmed)
    );

    let mut late_failure = update.clone();
    late_failure.status = TransactionStatus::Failed;
    assert_eq!(
        orchestrator.apply_settlement_update(&late_failure).await?,
        Some(TransactionStatus::Confirmed)
    );

    assert_eq!(harness.listing_status(listing_id).await, ListingStatus::Sold);
    assert_eq!(harness.db.get_agent(buyer.agent_id()).await?.unwrap().transaction_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_policy_update_takes_effect() -> Result<()> {
    let harness = Harness::new(MockBehavior::Confirm).await?;
    let seller = harness.register("seller", "SELLER", None).await;
    let buyer = harness.register("buyer", "BUYER", None).await;
    let listing_id = harness.list(&seller, "Piano", "400").await;

    assert_eq!(
        harness.purchase(&buyer, listing_id).await.error_code(),
        Some(codes::POLICY_VIOLATION)
    );

    let policy = json!({
        "maxTransactionValue": "500",
        "dailySpendingLimit": "1000",
        "maxGasPrice": "1",
        "allowedAssets": ["USDC"],
    });
    let updated = harness
        .call(&buyer, Method::UpdatePolicy, json!({"policy": policy}))
        .await
        .result
        .expect("policy updated");
    assert!(updated["policyHash"].as_str().is_some());

    let receipt = harness.purchase(&buyer, listing_id).await.result.expect("purchase");
    assert_eq!(receipt["status"], "CONFIRMED");
    Ok(())
}
