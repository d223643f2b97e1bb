use crate::{
    auth::proof_message,
    envelope::{Method, Params, Request, RequestId, Response},
    model::{AgentRole, Listing, Policy, Proof, Transaction},
    offer::OfferDecision,
    orchestrator::PurchaseReceipt,
    wallet::{address_for, sign_bytes},
    AgentId, ListingId, MarketError, Result, TransactionId,
};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferResponse {
    pub decision: OfferDecision,
    pub listing_id: ListingId,
    pub listing_price: Decimal,
    pub offer_price: Decimal,
    #[serde(default)]
    pub counter_price: Option<Decimal>,
}

/// Signing client an agent uses to talk to a marketplace.
pub struct AgentClient {
    http: reqwest::Client,
    endpoint: String,
    agent_id: AgentId,
    signing_key: SigningKey,
    policy_hash: RwLock<String>,
    next_id: AtomicU64,
}

impl AgentClient {
    pub fn new(base_url: &str, agent_id: AgentId, signing_key: SigningKey) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/rpc", base_url.trim_end_matches('/')),
            agent_id,
            signing_key,
            policy_hash: RwLock::new(Policy::default().hash()?),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Builds an envelope. Authenticated methods get the caller's
    /// `agentId` and a fresh proof.
    pub fn build_request(&self, method: Method, mut params: Params) -> Request {
        let id = Some(RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed).into()));
        if !method.requires_auth() {
            return Request::new(method, params, id);
        }

        params
            .entry("agentId")
            .or_insert_with(|| json!(self.agent_id.to_string()));
        let proof = self.sign(method, &params, Utc::now().timestamp_millis());
        Request::new(method, params, id).with_proof(proof)
    }

    pub fn sign(&self, method: Method, params: &Params, timestamp: i64) -> Proof {
        Proof {
            signature: sign_bytes(&self.signing_key, &proof_message(method, params, timestamp)),
            policy_hash: self.policy_hash.read().clone(),
            signer_id: address_for(&self.signing_key.verifying_key()),
            timestamp,
        }
    }

    pub async fn send(&self, request: &Request) -> Result<Value> {
        let response: Response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        read_response(request.id.as_ref(), response)
    }

    pub async fn call(&self, method: Method, params: Params) -> Result<Value> {
        let request = self.build_request(method, params);
        tracing::debug!(%method, id = ?request.id, "Calling marketplace");
        self.send(&request).await
    }

    async fn call_as<T: DeserializeOwned>(&self, method: Method, params: Value) -> Result<T> {
        let params = match params {
            Value::Object(params) => params,
            _ => Map::new(),
        };
        Ok(serde_json::from_value(self.call(method, params).await?)?)
    }

    pub async fn register(&self, name: &str, role: AgentRole, policy: Option<&Policy>) -> Result<Value> {
        let mut params = json!({
            "agentId": self.agent_id,
            "name": name,
            "role": role,
            "publicKey": self.public_key_hex(),
        });
        if let Some(policy) = policy {
            params["policy"] = serde_json::to_value(policy)?;
        }

        let agent: Value = self.call_as(Method::RegisterAgent, params).await?;
        if let Some(hash) = agent.get("policyHash").and_then(Value::as_str) {
            *self.policy_hash.write() = hash.to_string();
        }
        Ok(agent)
    }

    pub async fn update_policy(&self, policy: &Policy) -> Result<()> {
        let result: Value = self
            .call_as(Method::UpdatePolicy, json!({ "policy": policy }))
            .await?;
        if let Some(hash) = result.get("policyHash").and_then(Value::as_str) {
            *self.policy_hash.write() = hash.to_string();
        }
        Ok(())
    }

    pub async fn search(&self, query: &str, max_price: Option<Decimal>) -> Result<Vec<Listing>> {
        let mut params = json!({ "query": query });
        if let Some(max_price) = max_price {
            params["maxPrice"] = json!(max_price);
        }
        let result: Value = self.call_as(Method::Search, params).await?;
        Ok(serde_json::from_value(result["listings"].clone())?)
    }

    pub async fn get_listing(&self, listing_id: ListingId) -> Result<Listing> {
        self.call_as(Method::GetListing, json!({ "listingId": listing_id })).await
    }

    pub async fn create_listing(&self, title: &str, description: &str, price: Decimal, asset: &str) -> Result<Listing> {
        self.call_as(
            Method::CreateListing,
            json!({
                "title": title,
                "description": description,
                "price": price,
                "asset": asset,
            }),
        )
        .await
    }

    pub async fn offer(&self, listing_id: ListingId, offer_price: Decimal) -> Result<OfferResponse> {
        self.call_as(
            Method::Offer,
            json!({ "listingId": listing_id, "offerPrice": offer_price }),
        )
        .await
    }

    pub async fn purchase(&self, listing_id: ListingId) -> Result<PurchaseReceipt> {
        self.call_as(Method::Purchase, json!({ "listingId": listing_id })).await
    }

    pub async fn get_transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let result: Value = self
            .call_as(Method::GetTransaction, json!({ "transactionId": transaction_id }))
            .await?;
        Ok(serde_json::from_value(result["transaction"].clone())?)
    }
}

/// Unwraps a response to the request carrying `request_id`. Envelope
/// rejections come back with a null id and keep their error.
fn read_response(request_id: Option<&RequestId>, response: Response) -> Result<Value> {
    if response.id.is_some() && response.id.as_ref() != request_id {
        return Err(MarketError::Internal(format!(
            "Response id {:?} does not match request id {:?}",
            response.id, request_id
        )));
    }

    match (response.result, response.error) {
        (_, Some(error)) => Err(MarketError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        (Some(_), None) if response.id.is_none() && request_id.is_some() => Err(MarketError::Internal(
            format!("Response to request {:?} carries no id", request_id),
        )),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    }
}
