use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{Client, StatusCode};
use shared::{domain::Credential, protocol::RefreshResponse};
use tracing::{debug, error, info, warn};

use crate::{
    credential::CredentialStore,
    error::RefreshError,
    lock,
    subscription::{EventHub, Subscription},
    timer::TimerSlot,
};

#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(&self, current: Option<Credential>) -> Result<Credential, RefreshError>;
}

/// `POST {server_url}/auth/refresh`, presenting the current token as bearer.
pub struct HttpRefreshTransport {
    http: Client,
    server_url: String,
    timeout: Option<Duration>,
}

impl HttpRefreshTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    /// Use a preconfigured client, e.g. one carrying the browser session cookie.
    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            timeout: None,
        }
    }

    /// A request still unanswered after `timeout` fails as a network error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl RefreshTransport for HttpRefreshTransport {
    async fn refresh(&self, current: Option<Credential>) -> Result<Credential, RefreshError> {
        let mut request = self.http.post(format!("{}/auth/refresh", self.server_url));
        if let Some(current) = current {
            request = request.bearer_auth(current.access_token);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let res = request
            .send()
            .await
            .map_err(|err| RefreshError::Network(err.to_string()))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RefreshError::Unauthorized);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RefreshError::Network(format!("server answered {status}")));
        }
        if !status.is_success() {
            return Err(RefreshError::Unknown(format!("unexpected status {status}")));
        }

        let body: RefreshResponse = res
            .json()
            .await
            .map_err(|err| RefreshError::Unknown(format!("invalid refresh body: {err}")))?;
        Ok(body.into())
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Refreshed { expires_at: DateTime<Utc> },
    /// The session cannot be recovered; the UI must re-authenticate.
    Terminated { reason: RefreshError },
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

#[derive(Default)]
struct RefreshSlot {
    next_id: u64,
    /// Bumped by `shutdown`; a refresh started under an older generation
    /// must not touch the store or the timer.
    generation: u64,
    inflight: Option<InFlight>,
}

/// Single-flight credential refresh with a proactive refresh timer.
pub struct TokenRefreshCoordinator {
    store: Arc<CredentialStore>,
    transport: Arc<dyn RefreshTransport>,
    margin: Duration,
    request_timeout: Duration,
    slot: Mutex<RefreshSlot>,
    proactive: TimerSlot,
    events: EventHub<SessionEvent>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn RefreshTransport>,
        margin: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            margin,
            request_timeout,
            slot: Mutex::new(RefreshSlot::default()),
            proactive: TimerSlot::new(),
            events: EventHub::new(),
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    pub fn subscribe(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    /// Returns a credential valid beyond the margin, refreshing at most once
    /// no matter how many callers race here.
    pub async fn ensure_valid(self: &Arc<Self>) -> Result<Credential, RefreshError> {
        if !self.store.is_expired_or_expiring_within(self.margin) {
            if let Some(credential) = self.store.get() {
                return Ok(credential);
            }
        }
        self.shared_refresh().await
    }

    /// Refreshes even if the stored credential is still valid. Joins an
    /// in-flight refresh instead of starting a second one.
    pub async fn force_refresh(self: &Arc<Self>) -> Result<Credential, RefreshError> {
        self.shared_refresh().await
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.slot).inflight.is_some()
    }

    pub fn has_scheduled_refresh(&self) -> bool {
        self.proactive.is_pending()
    }

    /// Cancels the proactive timer and detaches any in-flight refresh, whose
    /// outcome is then discarded.
    pub fn shutdown(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        if let Some(inflight) = slot.inflight.take() {
            debug!(refresh_id = inflight.id, "refresh: detached in-flight refresh");
        }
        if self.proactive.cancel() {
            debug!("refresh: cancelled proactive refresh timer");
        }
    }

    fn shared_refresh(self: &Arc<Self>) -> RefreshFuture {
        let mut slot = lock(&self.slot);
        if let Some(inflight) = &slot.inflight {
            debug!(refresh_id = inflight.id, "refresh: joining in-flight refresh");
            return inflight.future.clone();
        }

        let id = slot.next_id;
        slot.next_id += 1;
        let generation = slot.generation;

        // The refresh runs on its own task so a cancelled waiter cannot
        // abandon it half way.
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move { coordinator.run_refresh(id, generation).await });
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(RefreshError::Unknown(format!("refresh task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        slot.inflight = Some(InFlight {
            id,
            future: future.clone(),
        });
        future
    }

    async fn run_refresh(self: Arc<Self>, id: u64, generation: u64) -> Result<Credential, RefreshError> {
        let _guard = InFlightGuard {
            coordinator: self.as_ref(),
            id,
        };

        info!(refresh_id = id, "refresh: requesting new credential");
        let request = self.transport.refresh(self.store.get());
        let outcome = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshError::Network(format!(
                "no answer within {}ms",
                self.request_timeout.as_millis()
            ))),
        };

        // Held while applying the outcome so `shutdown` is ordered either
        // entirely before or entirely after it.
        let slot = lock(&self.slot);
        if slot.generation != generation {
            drop(slot);
            info!(refresh_id = id, "refresh: session shut down; discarding result");
            return Err(RefreshError::Cancelled);
        }
        match outcome {
            Ok(credential) => {
                self.store.set(credential.clone());
                let current = self.store.get().unwrap_or(credential);
                self.schedule_proactive(&current);
                drop(slot);
                info!(
                    refresh_id = id,
                    expires_at = %current.expires_at,
                    "refresh: credential refreshed"
                );
                self.events.emit(&SessionEvent::Refreshed {
                    expires_at: current.expires_at,
                });
                Ok(current)
            }
            Err(err) if !err.is_fatal() => {
                drop(slot);
                warn!(refresh_id = id, "refresh: transient failure: {err}");
                Err(err)
            }
            Err(err) => {
                self.store.clear();
                self.proactive.cancel();
                drop(slot);
                error!(refresh_id = id, "refresh: fatal failure, terminating session: {err}");
                self.events.emit(&SessionEvent::Terminated {
                    reason: err.clone(),
                });
                Err(err)
            }
        }
    }

    fn schedule_proactive(self: &Arc<Self>, credential: &Credential) {
        let Some(due) = credential.refresh_due_at(self.margin) else {
            warn!("refresh: credential expiry out of range; no proactive refresh");
            self.proactive.cancel();
            return;
        };
        let Some(delay) = (due - Utc::now()).to_std().ok().filter(|d| !d.is_zero()) else {
            warn!(
                expires_at = %credential.expires_at,
                "refresh: credential already inside refresh margin; no proactive refresh"
            );
            self.proactive.cancel();
            return;
        };

        let coordinator: Weak<Self> = Arc::downgrade(self);
        self.proactive.schedule(delay, async move {
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            info!("refresh: proactive refresh timer fired");
            if let Err(err) = coordinator.force_refresh().await {
                warn!("refresh: proactive refresh failed: {err}");
            }
        });
        debug!(delay_ms = delay.as_millis() as u64, "refresh: proactive refresh scheduled");
    }
}

/// Clears the in-flight slot however the refresh task ends.
struct InFlightGuard<'a> {
    coordinator: &'a TokenRefreshCoordinator,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.coordinator.slot);
        if slot.inflight.as_ref().is_some_and(|inflight| inflight.id == self.id) {
            slot.inflight = None;
        }
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
