//! Marketplace and agent methods bound into the dispatcher.

use crate::{
    database::Database,
    dispatcher::{Dispatcher, RequestContext},
    envelope::{Method, Params},
    model::*,
    offer::{self, OfferDecision},
    orchestrator::{PurchaseOrchestrator, PurchaseRequest},
    wallet::{parse_public_key, WalletService},
    MarketError, Result,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Services shared by every handler.
#[derive(Clone)]
pub struct Market {
    pub db: Database,
    pub wallet: Arc<dyn WalletService>,
    pub orchestrator: Arc<PurchaseOrchestrator>,
    /// Policy given to agents that register without one.
    pub default_policy: Policy,
}

pub fn register_all(dispatcher: &mut Dispatcher, market: &Market) {
    route(dispatcher, market, Method::RegisterAgent, register_agent);
    route(dispatcher, market, Method::GetAgent, get_agent);
    route(dispatcher, market, Method::UpdatePolicy, update_policy);
    route(dispatcher, market, Method::Search, search);
    route(dispatcher, market, Method::GetListing, get_listing);
    route(dispatcher, market, Method::CreateListing, create_listing);
    route(dispatcher, market, Method::Offer, make_offer);
    route(dispatcher, market, Method::Purchase, purchase);
    route(dispatcher, market, Method::GetTransaction, get_transaction);
}

fn route<F, Fut>(dispatcher: &mut Dispatcher, market: &Market, method: Method, handler: F)
where
    F: Fn(Market, Params, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let market = market.clone();
    dispatcher.register_handler(method, move |params: Params, ctx: RequestContext| {
        handler(market.clone(), params, ctx)
    });
}

async fn register_agent(market: Market, params: Params, _ctx: RequestContext) -> Result<Value> {
    let agent_id = match params.get("agentId") {
        None | Some(Value::Null) => Uuid::new_v4(),
        Some(_) => uuid_param(&params, "agentId")?,
    };
    let role = AgentRole::from_str(&str_param(&params, "role")?)
        .map_err(|_| MarketError::InvalidParams("role must be BUYER, SELLER or MARKETPLACE".to_string()))?;
    let policy = match params.get("policy") {
        None | Some(Value::Null) => market.default_policy.clone(),
        Some(value) => policy_param(value)?,
    };

    let agent = Agent::new(
        agent_id,
        str_param(&params, "name")?,
        role,
        str_param(&params, "publicKey")?.to_lowercase(),
        policy,
    );
    agent.validate()?;
    parse_public_key(&agent.public_key)
        .map_err(|_| MarketError::InvalidParams("publicKey is not a valid ed25519 key".to_string()))?;

    market.db.create_agent(&agent).await?;
    market.wallet.register_agent_key(agent.id, &agent.public_key).await?;
    tracing::info!(agent_id = %agent.id, role = agent.role.as_str(), "Registered agent");

    agent_view(&agent)
}

async fn get_agent(market: Market, params: Params, _ctx: RequestContext) -> Result<Value> {
    let agent_id = uuid_param(&params, "agentId")?;
    let agent = market
        .db
        .get_agent(agent_id)
        .await?
        .ok_or(MarketError::AgentNotFound(agent_id))?;
    agent_view(&agent)
}

async fn update_policy(market: Market, params: Params, ctx: RequestContext) -> Result<Value> {
    let actor = ctx.actor()?;
    let policy = policy_param(
        params
            .get("policy")
            .ok_or_else(|| MarketError::InvalidParams("policy is required".to_string()))?,
    )?;

    if !market.db.update_policy(actor, &policy).await? {
        return Err(MarketError::AgentNotFound(actor));
    }
    tracing::info!(agent_id = %actor, "Updated policy");

    Ok(json!({
        "agentId": actor,
        "policy": policy,
        "policyHash": policy.hash()?,
    }))
}

async fn search(market: Market, params: Params, _ctx: RequestContext) -> Result<Value> {
    let query = match params.get("query") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(query)) => query.clone(),
        Some(_) => return Err(MarketError::InvalidParams("query must be a string".to_string())),
    };
    let max_price = optional_decimal_param(&params, "maxPrice")?;
    let limit = match params.get("limit") {
        None | Some(Value::Null) => DEFAULT_SEARCH_LIMIT,
        Some(value) => value
            .as_u64()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| MarketError::InvalidParams("limit must be a positive integer".to_string()))?
            .min(MAX_SEARCH_LIMIT as u64) as usize,
    };

    let listings = market.db.search_listings(&query, max_price, limit).await?;
    Ok(json!({
        "count": listings.len(),
        "listings": listings,
    }))
}

async fn get_listing(market: Market, params: Params, _ctx: RequestContext) -> Result<Value> {
    let listing_id = uuid_param(&params, "listingId")?;
    let listing = market
        .db
        .get_listing(listing_id)
        .await?
        .ok_or(MarketError::ListingNotFound(listing_id))?;
    Ok(serde_json::to_value(listing)?)
}

async fn create_listing(market: Market, params: Params, ctx: RequestContext) -> Result<Value> {
    let actor = ctx.actor()?;
    let seller = market
        .db
        .get_agent(actor)
        .await?
        .ok_or(MarketError::AgentNotFound(actor))?;
    if !seller.role.can_sell() {
        return Err(MarketError::Unauthorized(format!(
            "{} agents cannot create listings",
            seller.role.as_str()
        )));
    }

    let description = optional_text_param(&params, "description")?.unwrap_or_default();
    let asset = match params.get("asset") {
        None | Some(Value::Null) => "USDC".to_string(),
        Some(_) => str_param(&params, "asset")?.to_uppercase(),
    };

    let listing = Listing::new(
        seller.id,
        str_param(&params, "title")?,
        description,
        decimal_param(&params, "price")?,
        asset,
    );
    listing.validate()?;
    market.db.create_listing(&listing).await?;
    tracing::info!(listing_id = %listing.id, seller_id = %seller.id, price = %listing.price, "Created listing");

    Ok(serde_json::to_value(listing)?)
}

async fn make_offer(market: Market, params: Params, ctx: RequestContext) -> Result<Value> {
    ctx.actor()?;
    let listing_id = uuid_param(&params, "listingId")?;
    let offer_price = decimal_param(&params, "offerPrice")?;
    if offer_price <= Decimal::ZERO {
        return Err(MarketError::InvalidPrice("offerPrice must be greater than 0".to_string()));
    }

    let listing = market
        .db
        .get_listing(listing_id)
        .await?
        .ok_or(MarketError::ListingNotFound(listing_id))?;
    if listing.status != ListingStatus::Available {
        return Err(MarketError::ListingUnavailable {
            listing_id,
            status: listing.status,
        });
    }

    let decision = offer::evaluate(listing.price, offer_price);
    tracing::info!(%listing_id, %offer_price, ?decision, "Evaluated offer");

    match decision {
        OfferDecision::Accept => Ok(json!({
            "decision": decision,
            "listingId": listing_id,
            "listingPrice": listing.price,
            "offerPrice": offer_price,
        })),
        OfferDecision::Counter => Ok(json!({
            "decision": decision,
            "listingId": listing_id,
            "listingPrice": listing.price,
            "offerPrice": offer_price,
            "counterPrice": offer::counter_price(listing.price),
        })),
        OfferDecision::Reject => Err(MarketError::OfferRejected {
            listing_price: listing.price.to_string(),
            offer_price: offer_price.to_string(),
        }),
    }
}

async fn purchase(market: Market, params: Params, ctx: RequestContext) -> Result<Value> {
    let request = PurchaseRequest {
        buyer_id: ctx.actor()?,
        listing_id: uuid_param(&params, "listingId")?,
        destination_chain: match params.get("destinationChain") {
            None | Some(Value::Null) => None,
            Some(_) => Some(str_param(&params, "destinationChain")?),
        },
        request_proof: ctx
            .proof
            .clone()
            .ok_or_else(|| MarketError::Unauthorized("Proof required".to_string()))?,
    };

    let receipt = market.orchestrator.purchase(request).await?;
    Ok(serde_json::to_value(receipt)?)
}

async fn get_transaction(market: Market, params: Params, _ctx: RequestContext) -> Result<Value> {
    let transaction_id = uuid_param(&params, "transactionId")?;
    let transaction = market
        .db
        .get_transaction(transaction_id)
        .await?
        .ok_or_else(|| MarketError::TransactionNotFound(transaction_id.to_string()))?;
    let proofs = market.db.get_proofs_for_transaction(transaction_id).await?;

    Ok(json!({
        "transaction": transaction,
        "proofs": proofs,
    }))
}

fn agent_view(agent: &Agent) -> Result<Value> {
    let mut view = serde_json::to_value(agent)?;
    if let Value::Object(object) = &mut view {
        object.insert("policyHash".to_string(), json!(agent.policy.hash()?));
    }
    Ok(view)
}

fn str_param(params: &Params, key: &str) -> Result<String> {
    match params.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(MarketError::InvalidParams(format!("{} must be a non-empty string", key))),
    }
}

/// Free text that may be absent, null or empty.
fn optional_text_param(params: &Params, key: &str) -> Result<Option<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.trim().to_string())),
        Some(_) => Err(MarketError::InvalidParams(format!("{} must be a string", key))),
    }
}

fn uuid_param(params: &Params, key: &str) -> Result<Uuid> {
    let value = str_param(params, key)?;
    Uuid::parse_str(&value).map_err(|_| MarketError::InvalidParams(format!("{} must be a UUID", key)))
}

/// Amounts are accepted as strings or JSON numbers.
fn decimal_param(params: &Params, key: &str) -> Result<Decimal> {
    let parsed = match params.get(key) {
        Some(Value::String(value)) => Decimal::from_str(value.trim()).ok(),
        Some(Value::Number(value)) => Decimal::from_str(&value.to_string())
            .or_else(|_| Decimal::from_scientific(&value.to_string()))
            .ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MarketError::InvalidParams(format!("{} must be a decimal amount", key)))
}

fn optional_decimal_param(params: &Params, key: &str) -> Result<Option<Decimal>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => decimal_param(params, key).map(Some),
    }
}

fn policy_param(value: &Value) -> Result<Policy> {
    let policy: Policy = serde_json::from_value(value.clone())
        .map_err(|e| MarketError::InvalidParams(format!("Invalid policy: {}", e)))?;
    policy.validate()?;
    Ok(policy)
}
