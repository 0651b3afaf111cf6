use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::gate::config::GateConfig;
use crate::gate::errors::{AuthorizationError, SetupError};
use crate::gate::input::{DecisionInput, IdentityExtractor};
use crate::policy::errors::EvalError;
use crate::policy::loader;
use crate::policy::query::{Decision, PreparedQuery};
use crate::policy::types::PolicyReference;

/// A provisioned policy gate. Cloning is cheap and every clone shares the
/// same prepared query.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    reference: PolicyReference,
    query: PreparedQuery,
    identity: IdentityExtractor,
    eval_timeout: Option<Duration>,
}

impl PolicyGate {
    /// Load, compile and bind the configured policy. Nothing is installed
    /// unless every step succeeds.
    pub fn provision(config: &GateConfig) -> Result<Self, SetupError> {
        let identity = config.identity.compile()?;

        let policy = loader::load(&config.policy).inspect_err(|e| {
            tracing::error!(source = %config.policy, error = %e, "Failed to load policy");
        })?;
        let query = PreparedQuery::bind(Arc::new(policy), &config.query).inspect_err(|e| {
            tracing::error!(query = %config.query, error = %e, "Failed to bind decision path");
        })?;

        tracing::info!(
            source = %config.policy,
            query = %query,
            timeout_ms = config.eval_timeout_ms,
            "Policy gate provisioned"
        );

        Ok(Self {
            inner: Arc::new(GateInner {
                reference: config.policy.clone(),
                query,
                identity,
                eval_timeout: config.eval_timeout(),
            }),
        })
    }

    pub fn reference(&self) -> &PolicyReference {
        &self.inner.reference
    }

    pub fn query(&self) -> &PreparedQuery {
        &self.inner.query
    }

    pub fn input_for<B>(&self, request: &Request<B>) -> Result<DecisionInput, AuthorizationError> {
        DecisionInput::from_request(request, &self.inner.identity)
    }

    /// Evaluate the decision for one input. Only a definite `true` admits.
    pub async fn decide(&self, input: &DecisionInput) -> Result<(), AuthorizationError> {
        let document = input.to_document();
        let decision = self.evaluate(document).await;

        match decision {
            Ok(Decision::Value(true)) => Ok(()),
            Ok(Decision::Value(false)) => Err(AuthorizationError::Denied),
            Ok(Decision::Undefined) => Err(AuthorizationError::Undefined),
            Err(e) => Err(AuthorizationError::EvaluationFault(e)),
        }
    }

    async fn evaluate(&self, document: Value) -> Result<Decision, EvalError> {
        let cancel = CancellationToken::new();
        // Evaluation stops at its next check once this request is gone.
        let _guard = cancel.clone().drop_guard();

        let query = self.inner.query.clone();
        let task = tokio::task::spawn_blocking(move || query.eval(&document, &cancel));

        let joined = match self.inner.eval_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| EvalError::TimedOut(limit))?,
            None => task.await,
        };
        joined.map_err(|e| EvalError::Aborted(e.to_string()))?
    }

    /// Admit the request to `next` or reject it. An admitted request's
    /// response is returned exactly as `next` produced it.
    pub async fn authorize(&self, request: Request, next: Next) -> Result<Response, AuthorizationError> {
        let input = self.input_for(&request)?;
        tracing::debug!(
            method = %input.method,
            path = ?input.path,
            has_identity = input.identity.is_some(),
            "Evaluating request"
        );
        self.decide(&input).await?;
        Ok(next.run(request).await)
    }
}

/// Middleware entry point for `axum::middleware::from_fn_with_state`.
pub async fn authorize(
    State(gate): State<PolicyGate>,
    request: Request,
    next: Next,
) -> Result<Response, AuthorizationError> {
    gate.authorize(request, next).await
}
