use crate::{
    config::ProtocolConfig,
    envelope::{Method, Params, Request},
    wallet::{canonical_bytes, WalletService},
    AgentId, MarketError, Result,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Bytes a client signs to authenticate a call.
pub fn proof_message(method: Method, params: &Params, timestamp: i64) -> Vec<u8> {
    canonical_bytes(&json!({
        "method": method.as_str(),
        "params": params,
        "timestamp": timestamp,
    }))
}

/// The acting agent named by the required `agentId` parameter.
pub fn actor_id(params: &Params) -> Result<AgentId> {
    match params.get("agentId") {
        Some(Value::String(id)) => Uuid::parse_str(id)
            .map_err(|_| MarketError::InvalidParams("agentId must be a UUID".to_string())),
        _ => Err(MarketError::InvalidParams("agentId is required".to_string())),
    }
}

pub struct ProofAuthenticator {
    wallet: Arc<dyn WalletService>,
    freshness_window: Duration,
    max_clock_skew: Duration,
}

impl ProofAuthenticator {
    pub fn new(wallet: Arc<dyn WalletService>, config: &ProtocolConfig) -> Self {
        Self {
            wallet,
            freshness_window: config.freshness_window(),
            max_clock_skew: config.max_clock_skew(),
        }
    }

    /// Authenticated methods always need a proof; any request that carries
    /// one has it checked.
    pub fn requires_authentication(request: &Request) -> bool {
        request.method.requires_auth() || request.proof.is_some()
    }

    pub async fn authenticate(&self, request: &Request, now: DateTime<Utc>) -> Result<AgentId> {
        let proof = request
            .proof
            .as_ref()
            .ok_or_else(|| MarketError::Unauthorized("Proof required".to_string()))?;

        let actor = actor_id(&request.params)?;

        let age = now.timestamp_millis() - proof.timestamp;
        if age > self.freshness_window.as_millis() as i64 {
            return Err(MarketError::Unauthorized("Proof expired".to_string()));
        }
        if -age > self.max_clock_skew.as_millis() as i64 {
            return Err(MarketError::Unauthorized("Proof timestamp is in the future".to_string()));
        }

        let message = proof_message(request.method, &request.params, proof.timestamp);
        match self.wallet.verify_signature(actor, &proof.signature, &message).await {
            Ok(true) => Ok(actor),
            Ok(false) => Err(MarketError::Unauthorized("Invalid signature".to_string())),
            Err(e) => {
                tracing::warn!(%actor, error = %e, "Signature verification failed");
                Err(MarketError::Unauthorized("Invalid signature".to_string()))
            }
        }
    }
}
