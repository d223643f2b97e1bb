//! # agentmarket - Agent-to-agent transaction protocol
//!
//! Autonomous agents register, publish listings, negotiate and buy from each
//! other over a versioned request/response envelope.
//!
//! ## Architecture
//!
//! - **Envelope**: structural validation of untrusted requests and response shapes
//! - **Dispatcher**: method registry with proof authentication in front of handlers
//! - **Auth**: signed proofs with a freshness window, verified through the wallet
//! - **Orchestrator**: purchase saga over the local store and an external settlement provider
//! - **Offer**: deterministic accept / counter / reject price policy
//! - **Client**: signing client stub for agents talking to the marketplace

pub mod auth;
pub mod client;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod model;
pub mod offer;
pub mod orchestrator;
pub mod server;
pub mod settlement;
pub mod wallet;

pub use auth::ProofAuthenticator;
pub use client::AgentClient;
pub use config::AppConfig;
pub use database::Database;
pub use dispatcher::Dispatcher;
pub use envelope::{Method, Request, Response};
pub use error::{MarketError, Result};
pub use model::{Agent, Listing, Policy, Transaction, TransactionStatus};
pub use orchestrator::PurchaseOrchestrator;
pub use settlement::SettlementProvider;
pub use wallet::{LocalWallet, WalletService};

pub type AgentId = uuid::Uuid;
pub type ListingId = uuid::Uuid;
pub type TransactionId = uuid::Uuid;
