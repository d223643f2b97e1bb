use crate::{
    auth::ProofAuthenticator,
    envelope::{Method, Params, Request, Response},
    model::Proof,
    AgentId, MarketError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Per-call state. Built fresh for every request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub actor: Option<AgentId>,
    pub proof: Option<Proof>,
}

impl RequestContext {
    pub fn actor(&self) -> Result<AgentId> {
        self.actor
            .ok_or_else(|| MarketError::Unauthorized("Authenticated actor required".to_string()))
    }
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, params: Params, ctx: RequestContext) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Params, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Params, ctx: RequestContext) -> Result<Value> {
        (self)(params, ctx).await
    }
}

pub struct Dispatcher {
    handlers: HashMap<Method, Arc<dyn MethodHandler>>,
    authenticator: Arc<ProofAuthenticator>,
    served: AtomicU64,
}

impl Dispatcher {
    pub fn new(authenticator: Arc<ProofAuthenticator>) -> Self {
        Self {
            handlers: HashMap::new(),
            authenticator,
            served: AtomicU64::new(0),
        }
    }

    pub fn register_handler<H>(&mut self, method: Method, handler: H)
    where
        H: MethodHandler + 'static,
    {
        if self.handlers.insert(method, Arc::new(handler)).is_some() {
            tracing::warn!(%method, "Replaced existing handler");
        }
    }

    pub fn methods(&self) -> Vec<Method> {
        let mut methods: Vec<_> = self.handlers.keys().copied().collect();
        methods.sort();
        methods
    }

    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub async fn handle_text(&self, text: &str) -> Response {
        match serde_json::from_str::<Value>(text) {
            Ok(raw) => self.handle_message(raw).await,
            Err(e) => {
                self.served.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "Unparseable request");
                Response::failure(None, &MarketError::Parse(e.to_string()))
            }
        }
    }

    pub async fn handle_message(&self, raw: Value) -> Response {
        self.served.fetch_add(1, Ordering::Relaxed);
        let received_at = Utc::now();
        let correlation_id = Uuid::new_v4();

        let request = match Request::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(%correlation_id, error = %e, "Rejected envelope");
                return Response::failure(None, &e);
            }
        };

        let id = request.id.clone();
        let span = tracing::info_span!("dispatch", method = %request.method, %correlation_id);

        async move {
            tracing::info!(request_id = ?id, "Dispatching request");
            match self.dispatch(request, correlation_id, received_at).await {
                Ok(result) => Response::success(id, result),
                Err(e) => {
                    if e.is_internal() {
                        tracing::error!(error = %e, "Request failed");
                    } else {
                        tracing::info!(code = e.code(), error = %e, "Request rejected");
                    }
                    Response::failure(id, &e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: Request, correlation_id: Uuid, received_at: DateTime<Utc>) -> Result<Value> {
        let handler = self
            .handlers
            .get(&request.method)
            .cloned()
            .ok_or_else(|| MarketError::MethodNotFound(request.method.to_string()))?;

        let actor = if ProofAuthenticator::requires_authentication(&request) {
            Some(self.authenticator.authenticate(&request, received_at).await?)
        } else {
            None
        };

        let ctx = RequestContext {
            correlation_id,
            received_at,
            method: request.method,
            actor,
            proof: request.proof,
        };
        let params = request.params;

        match tokio::spawn(async move { handler.call(params, ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(MarketError::Internal(format!(
                "Handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(MarketError::Internal(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::envelope::codes;
    use crate::wallet::MockWalletService;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn dispatcher() -> Dispatcher {
        let mut wallet = MockWalletService::new();
        wallet.expect_verify_signature().returning(|_, _, _| Ok(false));
        Dispatcher::new(Arc::new(ProofAuthenticator::new(
            Arc::new(wallet),
            &ProtocolConfig::default(),
        )))
    }

    #[tokio::test]
    async fn test_success_keeps_request_id() {
        let mut dispatcher = dispatcher();
        dispatcher.register_handler(Method::Search, |params: Params, _ctx: RequestContext| async move {
            Ok::<_, MarketError>(json!({ "echo": params.get("query").cloned() }))
        });

        let response = dispatcher
            .handle_message(json!({"version": "2.0", "method": "marketplace.search", "params": {"query": "lamp"}, "id": "r1"}))
            .await;

        assert_eq!(response.result, Some(json!({"echo": "lamp"})));
        assert_eq!(serde_json::to_value(&response).unwrap()["id"], "r1");
        assert_eq!(dispatcher.requests_served(), 1);
    }

    #[tokio::test]
    async fn test_validation_and_lookup_errors() {
        let dispatcher = dispatcher();

        let parse = dispatcher.handle_text("{not json").await;
        assert_eq!(parse.error_code(), Some(codes::PARSE_ERROR));

        let invalid = dispatcher.handle_message(json!({"version": "1.0", "method": "agent.get", "id": 3})).await;
        assert_eq!(invalid.error_code(), Some(codes::INVALID_REQUEST));
        assert!(invalid.id.is_none());

        let missing = dispatcher.handle_message(json!({"version": "2.0", "method": "agent.get", "id": 4})).await;
        assert_eq!(missing.error_code(), Some(codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_authenticated_method_without_proof_never_runs() {
        let mut dispatcher = dispatcher();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        dispatcher.register_handler(Method::Offer, move |_params: Params, _ctx: RequestContext| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, MarketError>(Value::Null)
            }
        });

        let response = dispatcher
            .handle_message(json!({"version": "2.0", "method": "marketplace.offer", "params": {"agentId": Uuid::new_v4()}, "id": 1}))
            .await;

        assert_eq!(response.error_code(), Some(codes::UNAUTHORIZED));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let mut dispatcher = dispatcher();
        dispatcher.register_handler(Method::GetAgent, |_params: Params, _ctx: RequestContext| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, MarketError>(Value::Null)
        });

        let response = dispatcher
            .handle_message(json!({"version": "2.0", "method": "agent.get", "id": 9}))
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert!(error.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_store_failures_are_generic_on_the_wire() {
        let mut dispatcher = dispatcher();
        dispatcher.register_handler(Method::GetListing, |_params: Params, _ctx: RequestContext| async move {
            Err::<Value, _>(MarketError::Database(sqlx::Error::PoolTimedOut))
        });

        let response = dispatcher
            .handle_message(json!({"version": "2.0", "method": "marketplace.getListing", "id": 2}))
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.message, "Internal error");
        assert_eq!(dispatcher.methods(), vec![Method::GetListing]);
    }
}
