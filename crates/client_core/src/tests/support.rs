use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{CallId, CallKind, Credential, UserId},
    protocol::{CallSignal, ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::{
    call::SignalSender,
    error::{ConnectionError, RefreshError},
    refresh::RefreshTransport,
    transport::{SocketConnector, SocketLink},
};

/// Routes client logs through the test harness; `RUST_LOG` overrides the
/// default filter.
pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("client_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub(crate) fn credential_valid_for(secs: i64) -> Credential {
    Credential::new(
        format!("token-{secs}"),
        Utc::now() + chrono::Duration::seconds(secs),
    )
}

/// Lets spawned tasks on the current-thread runtime run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn signal(call_id: &str, seq: u64) -> CallSignal {
    CallSignal {
        call_id: CallId::from(call_id),
        seq,
        kind: CallKind::Audio,
        peer_id: UserId::from("bob"),
        reason: None,
    }
}

/// Refresh endpoint double. Answers from a script, then issues credentials
/// valid for `lifetime`.
pub(crate) struct ScriptedRefresh {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Credential, RefreshError>>>,
    lifetime: chrono::Duration,
    delay: Duration,
}

impl ScriptedRefresh {
    pub(crate) fn issuing(lifetime_secs: i64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            lifetime: chrono::Duration::seconds(lifetime_secs),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn then(self, response: Result<Credential, RefreshError>) -> Self {
        self.script.lock().expect("script").push_back(response);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshTransport for ScriptedRefresh {
    async fn refresh(&self, _current: Option<Credential>) -> Result<Credential, RefreshError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().expect("script").pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Credential::new(
                format!("issued-{call}"),
                Utc::now() + self.lifetime,
            ))
        })
    }
}

/// Server side of one in-memory socket.
pub(crate) struct MemorySocket {
    pub(crate) access_token: String,
    pub(crate) to_client: mpsc::UnboundedSender<ServerEvent>,
    pub(crate) from_client: mpsc::UnboundedReceiver<ClientRequest>,
}

impl MemorySocket {
    pub(crate) fn push(&self, event: ServerEvent) {
        self.to_client.send(event).expect("client reader alive");
    }

    pub(crate) fn ack(&self, user_id: &str) {
        self.push(ServerEvent::Authenticated {
            user_id: UserId::from(user_id),
        });
    }
}

/// Connector whose sockets are driven by the test.
#[derive(Default)]
pub(crate) struct MemoryConnector {
    auto_ack: Option<String>,
    failures: Mutex<VecDeque<ConnectionError>>,
    opened: Mutex<VecDeque<MemorySocket>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acknowledges every opened socket as `user_id` immediately.
    pub(crate) fn auto_ack(user_id: &str) -> Self {
        Self {
            auto_ack: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn fail_next(&self, err: ConnectionError) {
        self.failures.lock().expect("failures").push_back(err);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn next_socket(&self) -> MemorySocket {
        self.opened
            .lock()
            .expect("opened")
            .pop_front()
            .expect("a socket was opened")
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn open(&self, credential: &Credential) -> Result<SocketLink, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().expect("failures").pop_front() {
            return Err(err);
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        if let Some(user_id) = &self.auto_ack {
            to_client
                .send(ServerEvent::Authenticated {
                    user_id: UserId::from(user_id.as_str()),
                })
                .expect("fresh channel");
        }
        self.opened.lock().expect("opened").push_back(MemorySocket {
            access_token: credential.access_token.clone(),
            to_client,
            from_client,
        });
        Ok(SocketLink { outbound, inbound })
    }
}

/// Records outbound call signals; can be switched to fail.
#[derive(Default)]
pub(crate) struct RecordingSender {
    sent: Mutex<Vec<ClientRequest>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub(crate) fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().expect("sent").clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl SignalSender for RecordingSender {
    fn send_signal(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.lock().expect("sent").push(request);
        Ok(())
    }
}
