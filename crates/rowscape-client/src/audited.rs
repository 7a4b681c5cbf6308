// crates/rowscape-client/src/audited.rs
// ============================================================================
// Module: Rowscape Audited Call Client
// Description: Recorded, pooled, capacity-aware external call dispatch.
// Purpose: Front all outbound HTTP/LLM traffic with hashing, call-index
//          allocation, and idempotent recording under a node-state.
// Dependencies: rowscape-core, reqwest, serde_json, crate::pool
// ============================================================================

//! ## Overview
//! Every external call flows through here: the request is canonicalised and
//! hashed, a call index is allocated from the landscape so duplicate
//! identical requests stay distinguishable on replay, a pool permit gates
//! dispatch, and the outcome is recorded. Capacity responses (429, 503) feed
//! the pool's AIMD controller and are never recorded as calls; all other
//! failures are recorded with status `error`. Middleware runs before hashing
//! so the recorded hash always covers the bytes actually sent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use reqwest::blocking::Client;
use rowscape_core::CallOutcome;
use rowscape_core::CallRecord;
use rowscape_core::CallSpec;
use rowscape_core::CallStatus;
use rowscape_core::CallType;
use rowscape_core::Landscape;
use rowscape_core::LandscapeError;
use rowscape_core::LlmMiddleware;
use rowscape_core::RunId;
use rowscape_core::StateId;
use rowscape_core::hashing::HashError;
use rowscape_core::hashing::stable_hash;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::pool::PoolError;
use crate::pool::PooledExecutor;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Audited call client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Landscape recording failed.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// Request canonicalization failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// The pool refused or lost the call.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The HTTP client could not be constructed.
    #[error("http client construction failed: {0}")]
    Http(String),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for the audited call client.
#[derive(Debug, Clone)]
pub struct AuditedCallConfig {
    /// Full-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// User agent sent on outbound requests.
    pub user_agent: String,
}

impl Default for AuditedCallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: "rowscape/0.1".to_string(),
        }
    }
}

// ============================================================================
// SECTION: Call Shapes
// ============================================================================

/// One outbound external call request.
#[derive(Debug, Clone)]
pub struct ExternalCallRequest {
    /// Owning run.
    pub run_id: RunId,
    /// Node-state the call executes under.
    pub state_id: StateId,
    /// Call kind.
    pub call_type: CallType,
    /// Endpoint URL the request is posted to.
    pub endpoint: String,
    /// JSON request payload.
    pub request_data: Value,
}

/// Result of one audited call dispatch.
#[derive(Debug)]
pub struct CallDispatch {
    /// Call outcome as observed by the caller.
    pub outcome: CallOutcome,
    /// Recorded call row; absent for capacity outcomes, which are not
    /// recorded so replay sees only attempts that reached the service
    /// conclusively.
    pub record: Option<CallRecord>,
    /// Canonical request hash used for recording and replay.
    pub request_hash: String,
}

// ============================================================================
// SECTION: Audited Call Client
// ============================================================================

/// Concurrency-limited, recording wrapper over outbound HTTP calls.
pub struct AuditedCallClient {
    /// Shared landscape handle.
    landscape: Arc<dyn Landscape>,
    /// Shared pool for this transform's calls.
    pool: Arc<PooledExecutor>,
    /// Blocking HTTP client.
    http: Client,
    /// Request middleware applied before hashing and dispatch.
    middleware: Vec<Box<dyn LlmMiddleware>>,
}

impl AuditedCallClient {
    /// Creates an audited call client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Http`] when the HTTP client cannot be built.
    pub fn new(
        landscape: Arc<dyn Landscape>,
        pool: Arc<PooledExecutor>,
        config: &AuditedCallConfig,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| ClientError::Http(err.to_string()))?;
        Ok(Self {
            landscape,
            pool,
            http,
            middleware: Vec::new(),
        })
    }

    /// Installs a request middleware; middleware run in installation order.
    pub fn add_middleware(&mut self, middleware: Box<dyn LlmMiddleware>) {
        self.middleware.push(middleware);
    }

    /// Executes one audited call end to end.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for recording and pool failures. Service
    /// failures are values inside [`CallDispatch::outcome`].
    pub fn execute(&self, request: ExternalCallRequest) -> Result<CallDispatch, ClientError> {
        let prepared = self.prepare(request)?;
        let receiver = self.pool.submit(prepared.job())?;
        let outcome = receiver.recv().map_err(|_| PoolError::ShutDown)?;
        self.record(prepared, outcome)
    }

    /// Executes a batch of audited calls through the pool, gathering results
    /// in submission order.
    ///
    /// Partial failures stay per-call: each dispatch carries its own outcome
    /// rather than failing the batch.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for recording and pool failures.
    pub fn execute_many(
        &self,
        requests: Vec<ExternalCallRequest>,
    ) -> Result<Vec<CallDispatch>, ClientError> {
        let mut in_flight = Vec::with_capacity(requests.len());
        for request in requests {
            let prepared = self.prepare(request)?;
            let receiver = self.pool.submit(prepared.job())?;
            in_flight.push((prepared, receiver));
        }
        let mut dispatches = Vec::with_capacity(in_flight.len());
        for (prepared, receiver) in in_flight {
            let outcome = receiver.recv().map_err(|_| PoolError::ShutDown)?;
            dispatches.push(self.record(prepared, outcome)?);
        }
        Ok(dispatches)
    }

    /// Canonicalises the request, allocates its call index, and builds the
    /// dispatch closure.
    fn prepare(&self, request: ExternalCallRequest) -> Result<PreparedCall, ClientError> {
        let mut payload = request.request_data;
        for middleware in &self.middleware {
            payload = middleware.before_request(payload);
        }
        let request_hash = stable_hash(&payload)?;
        let call_index =
            self.landscape.allocate_call_index(&request.state_id, request.call_type)?;
        debug!(
            call_type = request.call_type.label(),
            call_index,
            request_hash = %request_hash,
            "external call prepared"
        );
        Ok(PreparedCall {
            run_id: request.run_id,
            state_id: request.state_id,
            call_type: request.call_type,
            call_index,
            endpoint: request.endpoint,
            payload,
            request_hash,
            http: self.http.clone(),
        })
    }

    /// Records the call row appropriate to the outcome.
    fn record(
        &self,
        prepared: PreparedCall,
        outcome: CallOutcome,
    ) -> Result<CallDispatch, ClientError> {
        let record = match &outcome {
            CallOutcome::Success {
                response,
                latency_ms,
            } => Some(self.landscape.record_call(CallSpec {
                run_id: prepared.run_id.clone(),
                state_id: prepared.state_id.clone(),
                call_type: prepared.call_type,
                call_index: prepared.call_index,
                status: CallStatus::Success,
                request_data: prepared.payload.clone(),
                response_data: Some(response.clone()),
                latency_ms: *latency_ms,
            })?),
            // Capacity feedback throttles the pool; the attempt never
            // reached a conclusive service answer, so nothing is recorded.
            CallOutcome::Capacity {
                ..
            } => None,
            CallOutcome::Transient {
                ..
            }
            | CallOutcome::Terminal {
                ..
            } => Some(self.landscape.record_call(CallSpec {
                run_id: prepared.run_id.clone(),
                state_id: prepared.state_id.clone(),
                call_type: prepared.call_type,
                call_index: prepared.call_index,
                status: CallStatus::Error,
                request_data: prepared.payload.clone(),
                response_data: None,
                latency_ms: 0,
            })?),
        };
        Ok(CallDispatch {
            outcome,
            record,
            request_hash: prepared.request_hash,
        })
    }
}

// ============================================================================
// SECTION: Prepared Calls
// ============================================================================

/// A call that has been hashed and indexed but not yet dispatched.
struct PreparedCall {
    /// Owning run.
    run_id: RunId,
    /// Node-state the call executes under.
    state_id: StateId,
    /// Call kind.
    call_type: CallType,
    /// Allocated call index.
    call_index: u32,
    /// Endpoint URL.
    endpoint: String,
    /// Payload after middleware.
    payload: Value,
    /// Canonical request hash.
    request_hash: String,
    /// HTTP client clone for the worker.
    http: Client,
}

impl PreparedCall {
    /// Builds the dispatch closure run on a pool worker.
    fn job(&self) -> impl FnOnce() -> CallOutcome + Send + 'static {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let payload = self.payload.clone();
        move || dispatch_http(&http, &endpoint, &payload)
    }
}

/// Sends one HTTP POST and classifies the outcome.
fn dispatch_http(http: &Client, endpoint: &str, payload: &Value) -> CallOutcome {
    let started = Instant::now();
    let response = match http.post(endpoint).json(payload).send() {
        Ok(response) => response,
        Err(err) => {
            // Connect failures and timeouts are transient by policy.
            return CallOutcome::Transient {
                message: err.to_string(),
            };
        }
    };
    let status = response.status().as_u16();
    if status == 429 || status == 503 {
        return CallOutcome::Capacity {
            status,
        };
    }
    if status >= 500 {
        return CallOutcome::Transient {
            message: format!("server error: status {status}"),
        };
    }
    if status >= 400 {
        return CallOutcome::Terminal {
            message: format!("client error: status {status}"),
        };
    }
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match response.json::<Value>() {
        Ok(body) => CallOutcome::Success {
            response: body,
            latency_ms,
        },
        Err(err) => CallOutcome::Terminal {
            message: format!("unparseable response body: {err}"),
        },
    }
}
