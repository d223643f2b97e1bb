use crate::{config::WalletConfig, AgentId, MarketError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Serializes a JSON value with object keys sorted at every level, so both
/// sides of a signature agree on the exact bytes.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<_> = object.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    pub domain: String,
    pub primary_type: String,
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub agent_id: AgentId,
    pub typed_data: TypedData,
}

/// Signing and verification contract the protocol layer and the
/// orchestrator depend on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletService: Send + Sync {
    /// Wallet address of the agent, provisioning one on first use.
    async fn get_address(&self, agent_id: AgentId) -> Result<String>;

    /// Signs typed data with the agent's wallet key; returns base64.
    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String>;

    /// Checks a base64 signature over `message` against the agent's
    /// registered signing key. Unknown agents and malformed signatures
    /// verify as `false`.
    async fn verify_signature(&self, agent_id: AgentId, signature: &str, message: &[u8]) -> Result<bool>;

    /// Registers the hex ed25519 key the agent signs requests with.
    async fn register_agent_key(&self, agent_id: AgentId, public_key: &str) -> Result<()>;
}

pub fn address_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("0x{}", hex::encode(&digest[12..]))
}

pub fn sign_bytes(key: &SigningKey, message: &[u8]) -> String {
    general_purpose::STANDARD.encode(key.sign(message).to_bytes())
}

pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key).map_err(|e| MarketError::Crypto(e.to_string()))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MarketError::Crypto("Public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array).map_err(|e| MarketError::Crypto(e.to_string()))
}

/// In-process wallet. Request-signing keys are registered public keys;
/// wallet keys are derived per agent from a master seed, so addresses
/// survive restarts without storing secrets.
pub struct LocalWallet {
    master_seed: [u8; 32],
    registered: RwLock<HashMap<AgentId, VerifyingKey>>,
    wallets: RwLock<HashMap<AgentId, SigningKey>>,
}

impl LocalWallet {
    pub fn new(master_seed: [u8; 32]) -> Self {
        Self {
            master_seed,
            registered: RwLock::new(HashMap::new()),
            wallets: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &WalletConfig) -> Result<Self> {
        let seed: [u8; 32] = match &config.master_seed {
            Some(seed_hex) => {
                let bytes = hex::decode(seed_hex)
                    .map_err(|e| MarketError::Config(format!("Invalid wallet master seed: {}", e)))?;
                bytes
                    .try_into()
                    .map_err(|_| MarketError::Config("Wallet master seed must be 32 bytes".to_string()))?
            }
            None => {
                tracing::warn!("No wallet master seed configured; wallet addresses will change on restart");
                let mut seed = [0u8; 32];
                OsRng.fill_bytes(&mut seed);
                seed
            }
        };
        Ok(Self::new(seed))
    }

    pub fn register_key(&self, agent_id: AgentId, public_key: &str) -> Result<()> {
        let key = parse_public_key(public_key)?;
        self.registered.write().insert(agent_id, key);
        Ok(())
    }

    fn wallet_key(&self, agent_id: AgentId) -> SigningKey {
        if let Some(key) = self.wallets.read().get(&agent_id) {
            return key.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.master_seed);
        hasher.update(agent_id.as_bytes());
        let key = SigningKey::from_bytes(&hasher.finalize().into());

        tracing::info!(%agent_id, address = %address_for(&key.verifying_key()), "Provisioned wallet");
        self.wallets.write().entry(agent_id).or_insert(key).clone()
    }
}

#[async_trait]
impl WalletService for LocalWallet {
    async fn get_address(&self, agent_id: AgentId) -> Result<String> {
        Ok(address_for(&self.wallet_key(agent_id).verifying_key()))
    }

    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String> {
        let key = self.wallet_key(request.agent_id);
        let payload = serde_json::to_value(&request.typed_data)?;
        Ok(sign_bytes(&key, &canonical_bytes(&payload)))
    }

    async fn verify_signature(&self, agent_id: AgentId, signature: &str, message: &[u8]) -> Result<bool> {
        let key = match self.registered.read().get(&agent_id) {
            Some(key) => *key,
            None => return Ok(false),
        };

        let bytes = match general_purpose::STANDARD.decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let array: [u8; 64] = match bytes.try_into() {
            Ok(array) => array,
            Err(_) => return Ok(false),
        };

        Ok(key.verify(message, &Signature::from_bytes(&array)).is_ok())
    }

    async fn register_agent_key(&self, agent_id: AgentId, public_key: &str) -> Result<()> {
        self.register_key(agent_id, public_key)
    }
}
