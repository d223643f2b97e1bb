//! Wire envelopes for the agent protocol and their structural validation.

use crate::{model::Proof, MarketError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;

pub const PROTOCOL_VERSION: &str = "2.0";

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const LISTING_NOT_FOUND: i64 = -32001;
    pub const POLICY_VIOLATION: i64 = -32002;
    pub const UNAUTHORIZED: i64 = -32003;
    pub const OFFER_REJECTED: i64 = -32004;
    pub const INVALID_PRICE: i64 = -32005;
    pub const SETTLEMENT_FAILED: i64 = -32006;
    pub const SETTLEMENT_TIMEOUT: i64 = -32007;
}

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    #[serde(rename = "agent.register")]
    RegisterAgent,
    #[serde(rename = "agent.get")]
    GetAgent,
    #[serde(rename = "agent.updatePolicy")]
    UpdatePolicy,
    #[serde(rename = "marketplace.search")]
    Search,
    #[serde(rename = "marketplace.getListing")]
    GetListing,
    #[serde(rename = "marketplace.createListing")]
    CreateListing,
    #[serde(rename = "marketplace.offer")]
    Offer,
    #[serde(rename = "marketplace.purchase")]
    Purchase,
    #[serde(rename = "marketplace.getTransaction")]
    GetTransaction,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::RegisterAgent,
        Method::GetAgent,
        Method::UpdatePolicy,
        Method::Search,
        Method::GetListing,
        Method::CreateListing,
        Method::Offer,
        Method::Purchase,
        Method::GetTransaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::RegisterAgent => "agent.register",
            Method::GetAgent => "agent.get",
            Method::UpdatePolicy => "agent.updatePolicy",
            Method::Search => "marketplace.search",
            Method::GetListing => "marketplace.getListing",
            Method::CreateListing => "marketplace.createListing",
            Method::Offer => "marketplace.offer",
            Method::Purchase => "marketplace.purchase",
            Method::GetTransaction => "marketplace.getTransaction",
        }
    }

    /// Methods that always require a valid proof.
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Method::UpdatePolicy | Method::CreateListing | Method::Offer | Method::Purchase
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| MarketError::InvalidRequest(format!("Unsupported method: {}", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: String,
    pub method: Method,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Request {
    pub fn new(method: Method, params: Params, id: Option<RequestId>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            method,
            params,
            id,
            proof: None,
        }
    }

    pub fn with_proof(mut self, proof: Proof) -> Self {
        self.proof = Some(proof);
        self
    }

    /// Structural validation of an untrusted payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err(MarketError::InvalidRequest("Request must be an object".to_string())),
        };

        match object.remove("version") {
            Some(Value::String(v)) if v == PROTOCOL_VERSION => {}
            _ => {
                return Err(MarketError::InvalidRequest(format!(
                    "version must be \"{}\"",
                    PROTOCOL_VERSION
                )))
            }
        }

        let method = match object.remove("method") {
            Some(Value::String(name)) => name.parse::<Method>()?,
            _ => return Err(MarketError::InvalidRequest("method must be a string".to_string())),
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return Err(MarketError::InvalidRequest("params must be an object".to_string())),
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(RequestId::String(s)),
            Some(Value::Number(n)) => Some(RequestId::Number(n)),
            Some(_) => {
                return Err(MarketError::InvalidRequest(
                    "id must be a string or a number".to_string(),
                ))
            }
        };

        let proof = match object.remove("proof") {
            None | Some(Value::Null) => None,
            Some(value) => Some(validate_proof(value)?),
        };

        Ok(Self {
            version: PROTOCOL_VERSION.to_string(),
            method,
            params,
            id,
            proof,
        })
    }
}

fn validate_proof(value: Value) -> Result<Proof> {
    let object = value
        .as_object()
        .ok_or_else(|| MarketError::InvalidRequest("proof must be an object".to_string()))?;

    for field in ["signature", "policyHash", "signerId"] {
        match object.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(MarketError::InvalidRequest(format!(
                    "proof.{} must be a non-empty string",
                    field
                )))
            }
        }
    }
    match object.get("timestamp") {
        Some(Value::Number(n)) if n.as_i64().is_some_and(|t| t >= 0) => {}
        _ => {
            return Err(MarketError::InvalidRequest(
                "proof.timestamp must be a non-negative integer".to_string(),
            ))
        }
    }

    serde_json::from_value(value).map_err(|e| MarketError::InvalidRequest(format!("Invalid proof: {}", e)))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&MarketError> for ErrorObject {
    fn from(err: &MarketError) -> Self {
        Self {
            code: err.code(),
            message: err.public_message(),
            data: err.data(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<RequestId>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<RequestId>, error: &MarketError) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(ErrorObject::from(error)),
            id,
        }
    }

    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }
}
