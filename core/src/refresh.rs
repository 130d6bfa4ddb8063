use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::transport::{ApiRequest, ApiResponse, ByteStream, Transport};

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Produces a fresh access credential, or fails if the session is gone.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, credentials: &CredentialStore) -> Result<Credential>;
}

/// Calls the backend refresh endpoint directly on the transport, so the
/// call never carries the stale bearer and never re-enters the coordinator.
pub struct EndpointRefresher {
    transport: Arc<dyn Transport>,
    path: String,
}

impl EndpointRefresher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_path(transport, REFRESH_PATH)
    }

    pub fn with_path(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl CredentialRefresher for EndpointRefresher {
    async fn refresh(&self, credentials: &CredentialStore) -> Result<Credential> {
        // Without a stored refresh token the cookie jar carries it.
        let body = match credentials.refresh_token() {
            Some(token) => json!({ "refreshToken": token }),
            None => json!({}),
        };
        let request = ApiRequest::post(self.path.clone()).json(body);
        let response = self.transport.send(&request, None).await?;
        let issued = parse_issued_tokens(&response)?;
        if let Some(rotated) = issued.refresh_token {
            credentials.set_refresh_token(Some(rotated));
        }
        Ok(issued.credential)
    }
}

/// Tokens handed out by the login, register and refresh endpoints.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub credential: Credential,
    pub refresh_token: Option<String>,
}

/// Reads `accessToken` either at the top level or inside the `data` envelope.
pub fn parse_issued_tokens(response: &ApiResponse) -> Result<IssuedTokens> {
    let value: Value = response.json()?;
    let access_token = token_field(&value, "accessToken")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::MalformedResponse("response carries no accessToken".into()))?;
    let mut credential = Credential::new(access_token);
    if let Some(seconds) = token_field(&value, "tokenExpires").and_then(Value::as_i64) {
        credential = credential.with_expiry(Utc::now() + Duration::seconds(seconds));
    }
    let refresh_token = token_field(&value, "refreshToken")
        .and_then(Value::as_str)
        .map(str::to_owned);
    Ok(IssuedTokens {
        credential,
        refresh_token,
    })
}

fn token_field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let present = |v: &&Value| !v.is_null();
    value
        .get(name)
        .filter(present)
        .or_else(|| value.get("data").and_then(|data| data.get(name)).filter(present))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

type Resume = Box<dyn FnOnce(Result<Credential>) -> BoxFuture<'static, ()> + Send>;

/// A request parked until the in-flight refresh settles.
///
/// `resume` is called exactly once: with the new credential to replay the
/// request, or with the error that rejects it.
pub struct PendingRequest {
    pub request: ApiRequest,
    resume: Resume,
}

struct RefreshQueue {
    state: RefreshState,
    pending: VecDeque<PendingRequest>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    refresher: Arc<dyn CredentialRefresher>,
    queue: Mutex<RefreshQueue>,
}

/// Routes requests to the transport and recovers from stale credentials.
///
/// However many requests hit a 401 at once, only one refresh runs; every
/// request that failed meanwhile waits in a FIFO queue and is replayed once
/// with the refreshed credential. A replayed request that still gets a 401
/// surfaces [`Error::SessionExpired`] instead of looping.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: CredentialStore,
        refresher: Arc<dyn CredentialRefresher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                credentials,
                refresher,
                queue: Mutex::new(RefreshQueue {
                    state: RefreshState::Idle,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// Uses [`EndpointRefresher`] against the same transport.
    pub fn with_endpoint_refresh(transport: Arc<dyn Transport>, credentials: CredentialStore) -> Self {
        let refresher = Arc::new(EndpointRefresher::new(transport.clone()));
        Self::new(transport, credentials, refresher)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.shared.credentials
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.shared.transport.clone()
    }

    pub fn state(&self) -> RefreshState {
        self.shared.queue.lock().state
    }

    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.execute(request, |transport, request, credential| {
            async move { transport.send(&request, credential.as_ref()).await }.boxed()
        })
        .await
    }

    pub async fn open_stream(&self, request: ApiRequest) -> Result<ByteStream> {
        self.execute(request, |transport, request, credential| {
            async move { transport.open_stream(&request, credential.as_ref()).await }.boxed()
        })
        .await
    }

    async fn execute<T, F>(&self, request: ApiRequest, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Transport>, ApiRequest, Option<Credential>) -> BoxFuture<'static, Result<T>>
            + Send
            + Sync
            + 'static,
    {
        let credential = self.shared.credentials.credential();
        let stale = credential.as_ref().is_some_and(Credential::needs_refresh);
        if stale {
            debug!(path = %request.path, "credential about to expire, refreshing first");
        } else {
            match call(self.shared.transport.clone(), request.clone(), credential.clone()).await {
                Err(err) if err.is_auth_failure() => {
                    if request.is_replayed() {
                        return Err(self.expire(credential.as_ref()));
                    }
                    debug!(path = %request.path, "request unauthorized, queueing for refresh");
                }
                other => return other,
            }
        }
        self.park(request, Arc::new(call)).await
    }

    async fn park<T, F>(&self, request: ApiRequest, call: Arc<F>) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Transport>, ApiRequest, Option<Credential>) -> BoxFuture<'static, Result<T>>
            + Send
            + Sync
            + 'static,
    {
        let request = request.into_replay();
        let (tx, rx) = oneshot::channel();
        let coordinator = self.clone();
        let replay = request.clone();
        let resume: Resume = Box::new(move |outcome| {
            async move {
                let result = match outcome {
                    Ok(credential) => {
                        let path = replay.path.clone();
                        match (*call)(coordinator.transport(), replay, Some(credential.clone())).await {
                            Err(err) if err.is_auth_failure() => {
                                warn!(path = %path, "replayed request still unauthorized");
                                Err(coordinator.expire(Some(&credential)))
                            }
                            other => other,
                        }
                    }
                    Err(err) => Err(err),
                };
                // The caller may have given up waiting.
                let _ = tx.send(result);
            }
            .boxed()
        });

        let start_refresh = {
            let mut queue = self.shared.queue.lock();
            queue.pending.push_back(PendingRequest { request, resume });
            match queue.state {
                RefreshState::Idle => {
                    queue.state = RefreshState::Refreshing;
                    true
                }
                RefreshState::Refreshing => false,
            }
        };
        if start_refresh {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run_refresh().await });
        }

        rx.await.unwrap_or(Err(Error::SessionExpired))
    }

    async fn run_refresh(&self) {
        info!("refreshing access credential");
        let started_with = self.shared.credentials.credential();
        let refresh = self.shared.refresher.refresh(&self.shared.credentials);
        let outcome = match AssertUnwindSafe(refresh).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("credential refresher panicked");
                Err(Error::SessionExpired)
            }
        };
        match (&outcome, &started_with) {
            (Ok(credential), _) => self.shared.credentials.set(credential.clone()),
            // A login that landed mid-refresh stays.
            (Err(_), Some(stale)) => {
                self.shared.credentials.clear_if_current(stale);
            }
            (Err(_), None) => {}
        }

        // Swap the queue out while flipping back to idle: anything that
        // fails after this point starts its own refresh cycle.
        let drained = {
            let mut queue = self.shared.queue.lock();
            queue.state = RefreshState::Idle;
            std::mem::take(&mut queue.pending)
        };

        match outcome {
            Ok(credential) => {
                info!(replays = drained.len(), "credential refreshed, replaying queued requests");
                for pending in drained {
                    tokio::spawn((pending.resume)(Ok(credential.clone())));
                }
            }
            Err(err) => {
                warn!(error = %err, rejected = drained.len(), "credential refresh failed");
                for pending in drained {
                    tokio::spawn((pending.resume)(Err(Error::SessionExpired)));
                }
            }
        }
    }

    fn expire(&self, credential: Option<&Credential>) -> Error {
        if let Some(credential) = credential {
            self.shared.credentials.clear_if_current(credential);
        }
        Error::SessionExpired
    }
}
