use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use shared::{
    domain::{Credential, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ReconnectConfig,
    error::{ConnectionError, RefreshError},
    lock,
    refresh::{SessionEvent, TokenRefreshCoordinator},
    subscription::{EventHub, Subscription},
    timer::TimerSlot,
    transport::{SocketConnector, SocketLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, ConnectionState::Authenticated)
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged { state: ConnectionState, epoch: u64 },
    Inbound { epoch: u64, event: ServerEvent },
    /// Pre-authentication buffer overflowed and was discarded.
    EventsDropped { epoch: u64, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Initial,
    Reconnect { force_refresh: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Transport,
    SessionRejected,
}

struct ConnectionInner {
    state: ConnectionState,
    epoch: u64,
    failed_attempts: u32,
    force_refresh_next: bool,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    reader: Option<JoinHandle<()>>,
    buffer: VecDeque<ServerEvent>,
    user_id: Option<UserId>,
}

/// Owns the socket connection and its lifecycle.
///
/// Every connection attempt starts a new epoch. Inbound frames carry the
/// epoch of the transport that produced them and are discarded once that
/// epoch is superseded. Frames that arrive before the auth ack are buffered
/// and replayed in order when it arrives.
pub struct ConnectionManager {
    refresh: Arc<TokenRefreshCoordinator>,
    connector: Arc<dyn SocketConnector>,
    reconnect: ReconnectConfig,
    buffer_capacity: usize,
    auth_ack_timeout: Duration,
    inner: Mutex<ConnectionInner>,
    reconnect_timer: TimerSlot,
    ack_timer: TimerSlot,
    events: EventHub<ConnectionEvent>,
    _session_subscription: Subscription,
}

impl ConnectionManager {
    pub fn new(
        refresh: Arc<TokenRefreshCoordinator>,
        connector: Arc<dyn SocketConnector>,
        reconnect: ReconnectConfig,
        buffer_capacity: usize,
        auth_ack_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let manager = weak.clone();
            let session_subscription = refresh.subscribe(move |event| {
                if let SessionEvent::Terminated { reason } = event {
                    if let Some(manager) = manager.upgrade() {
                        warn!("ws: session terminated ({reason}); disconnecting");
                        manager.disconnect();
                    }
                }
            });

            Self {
                refresh,
                connector,
                reconnect,
                buffer_capacity,
                auth_ack_timeout,
                inner: Mutex::new(ConnectionInner {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    failed_attempts: 0,
                    force_refresh_next: false,
                    outbound: None,
                    reader: None,
                    buffer: VecDeque::new(),
                    user_id: None,
                }),
                reconnect_timer: TimerSlot::new(),
                ack_timer: TimerSlot::new(),
                events: EventHub::new(),
                _session_subscription: session_subscription,
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn epoch(&self) -> u64 {
        lock(&self.inner).epoch
    }

    /// User id acknowledged by the server for the current connection.
    pub fn user_id(&self) -> Option<UserId> {
        lock(&self.inner).user_id.clone()
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.inner).buffer.len()
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(handler)
    }

    /// Validates the credential, then opens a transport.
    ///
    /// A credential failure leaves the manager `Disconnected` and is returned
    /// as is. A transport failure is returned too, but the manager keeps
    /// retrying in `Reconnecting`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let epoch = {
            let mut inner = lock(&self.inner);
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Authenticated
            ) {
                debug!(epoch = inner.epoch, "ws: connect ignored; already {:?}", inner.state);
                return Ok(());
            }
            self.reconnect_timer.cancel();
            inner.failed_attempts = 0;
            begin_attempt(&mut inner)
        };
        self.emit_state(ConnectionState::Connecting, epoch);
        self.establish(epoch, AttemptKind::Initial).await
    }

    /// Moves to `Disconnected` from any state. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.reconnect_timer.cancel();
        self.ack_timer.cancel();
        let epoch = {
            let mut inner = lock(&self.inner);
            if inner.state == ConnectionState::Disconnected {
                return;
            }
            inner.epoch += 1;
            inner.outbound = None;
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.buffer.clear();
            inner.failed_attempts = 0;
            inner.force_refresh_next = false;
            inner.user_id = None;
            inner.state = ConnectionState::Disconnected;
            inner.epoch
        };
        info!(epoch, "ws: disconnected");
        self.emit_state(ConnectionState::Disconnected, epoch);
    }

    pub fn send(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        let inner = lock(&self.inner);
        if !inner.state.is_authenticated() {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = inner.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(request)
            .map_err(|_| ConnectionError::Transport("outbound channel closed".into()))
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        kind: AttemptKind,
    ) -> Result<(), ConnectionError> {
        let credential = match self.credential_for(kind).await {
            Ok(credential) => credential,
            Err(err) => return Err(self.credential_failed(epoch, kind, err)),
        };

        if !self.is_current_attempt(epoch) {
            return Err(ConnectionError::Superseded);
        }

        let link = match self.connector.open(&credential).await {
            Ok(link) => link,
            Err(err) => {
                if !self.is_current_attempt(epoch) {
                    return Err(ConnectionError::Superseded);
                }
                warn!(epoch, "ws: failed to open transport: {err}");
                let reason = match &err {
                    ConnectionError::Rejected(api) if api.code.is_session_fatal() => {
                        DropReason::SessionRejected
                    }
                    _ => DropReason::Transport,
                };
                self.handle_transport_drop(epoch, reason);
                return Err(err);
            }
        };

        let mut inner = lock(&self.inner);
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            debug!(epoch, "ws: dropping transport opened for a superseded attempt");
            return Err(ConnectionError::Superseded);
        }
        let SocketLink { outbound, inbound } = link;
        inner.outbound = Some(outbound);
        inner.reader = Some(self.spawn_reader(epoch, inbound));
        drop(inner);
        info!(epoch, "ws: transport open; awaiting auth ack");
        self.arm_ack_timer(epoch);
        Ok(())
    }

    fn arm_ack_timer(self: &Arc<Self>, epoch: u64) {
        let manager = Arc::downgrade(self);
        let timeout = self.auth_ack_timeout;
        self.ack_timer.schedule(timeout, async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.is_current_attempt(epoch) {
                warn!(
                    epoch,
                    timeout_ms = timeout.as_millis() as u64,
                    "ws: no auth ack in time; dropping transport"
                );
                manager.handle_transport_drop(epoch, DropReason::Transport);
            }
        });
    }

    async fn credential_for(self: &Arc<Self>, kind: AttemptKind) -> Result<Credential, RefreshError> {
        match kind {
            AttemptKind::Reconnect {
                force_refresh: true,
            } => self.refresh.force_refresh().await,
            _ => self.refresh.ensure_valid().await,
        }
    }

    fn credential_failed(
        self: &Arc<Self>,
        epoch: u64,
        kind: AttemptKind,
        err: RefreshError,
    ) -> ConnectionError {
        if err.is_fatal() {
            self.disconnect();
            return ConnectionError::Auth(err);
        }
        match kind {
            AttemptKind::Initial => {
                let abandoned = {
                    let mut inner = lock(&self.inner);
                    if inner.epoch == epoch && inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Disconnected;
                        inner.epoch += 1;
                        Some(inner.epoch)
                    } else {
                        None
                    }
                };
                if let Some(epoch) = abandoned {
                    warn!(epoch, "ws: cannot connect without a valid credential: {err}");
                    self.emit_state(ConnectionState::Disconnected, epoch);
                }
            }
            AttemptKind::Reconnect { force_refresh } => {
                let reason = if force_refresh {
                    DropReason::SessionRejected
                } else {
                    DropReason::Transport
                };
                self.handle_transport_drop(epoch, reason);
            }
        }
        ConnectionError::Auth(err)
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        lock(&self.inner).epoch == epoch
    }

    fn is_current_attempt(&self, epoch: u64) -> bool {
        let inner = lock(&self.inner);
        inner.epoch == epoch && inner.state == ConnectionState::Connecting
    }

    fn spawn_reader(
        self: &Arc<Self>,
        epoch: u64,
        mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.handle_inbound(epoch, event);
            }
            if let Some(manager) = manager.upgrade() {
                manager.handle_transport_drop(epoch, DropReason::Transport);
            }
        })
    }

    fn handle_inbound(self: &Arc<Self>, epoch: u64, event: ServerEvent) {
        let mut notices = Vec::new();
        let mut deliver = Vec::new();
        {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                trace!(epoch, current = inner.epoch, "ws: discarding event from superseded epoch");
                return;
            }

            match event {
                ServerEvent::Authenticated { user_id } => {
                    if inner.state != ConnectionState::Connecting {
                        warn!(epoch, "ws: unexpected auth ack in state {:?}", inner.state);
                        return;
                    }
                    info!(epoch, user_id = %user_id, buffered = inner.buffer.len(), "ws: authenticated");
                    inner.state = ConnectionState::Authenticated;
                    inner.failed_attempts = 0;
                    inner.user_id = Some(user_id);
                    notices.push(ConnectionEvent::StateChanged {
                        state: ConnectionState::Authenticated,
                        epoch,
                    });
                    deliver.extend(inner.buffer.drain(..));
                    self.ack_timer.cancel();
                }
                ServerEvent::Error(api) if api.code.is_session_fatal() => {
                    warn!(epoch, "ws: server rejected session: {api}");
                    drop(inner);
                    self.handle_transport_drop(epoch, DropReason::SessionRejected);
                    return;
                }
                other => match inner.state {
                    ConnectionState::Authenticated => deliver.push(other),
                    ConnectionState::Connecting => {
                        if inner.buffer.len() >= self.buffer_capacity {
                            let count = inner.buffer.len() + 1;
                            inner.buffer.clear();
                            warn!(
                                epoch,
                                dropped = count,
                                capacity = self.buffer_capacity,
                                "ws: pre-auth buffer overflow; buffered events discarded"
                            );
                            notices.push(ConnectionEvent::EventsDropped { epoch, count });
                        } else {
                            inner.buffer.push_back(other);
                        }
                    }
                    state => {
                        trace!(epoch, "ws: ignoring {} in state {state:?}", other.name());
                    }
                },
            }
        }

        for notice in &notices {
            self.events.emit(notice);
        }
        // A handler may disconnect mid-replay; nothing from the old epoch
        // reaches anyone after that.
        for event in deliver {
            let inbound = ConnectionEvent::Inbound { epoch, event };
            if !self.events.emit_while(&inbound, || self.is_current_epoch(epoch)) {
                debug!(epoch, "ws: epoch superseded during delivery; dropping remaining events");
                break;
            }
        }
    }

    fn handle_transport_drop(self: &Arc<Self>, epoch: u64, reason: DropReason) {
        if !self.is_current_epoch(epoch) {
            return;
        }
        self.ack_timer.cancel();
        let (state, attempt, epoch) = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch || inner.state == ConnectionState::Disconnected {
                return;
            }
            inner.outbound = None;
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.buffer.clear();
            inner.user_id = None;
            if reason == DropReason::SessionRejected {
                inner.force_refresh_next = true;
            }

            let attempt = inner.failed_attempts;
            if self.reconnect.attempts_exhausted(attempt) {
                inner.state = ConnectionState::Disconnected;
                inner.epoch += 1;
                (inner.state, attempt, inner.epoch)
            } else {
                inner.failed_attempts += 1;
                inner.state = ConnectionState::Reconnecting {
                    attempt: inner.failed_attempts,
                };
                (inner.state, attempt, inner.epoch)
            }
        };

        if state == ConnectionState::Disconnected {
            error!(epoch, attempts = attempt, "ws: reconnect attempts exhausted; giving up");
            self.emit_state(state, epoch);
            return;
        }

        info!(epoch, ?reason, "ws: transport dropped; reconnecting");
        self.emit_state(state, epoch);
        self.schedule_reconnect(attempt, epoch);
    }

    fn schedule_reconnect(self: &Arc<Self>, attempt: u32, epoch: u64) {
        let delay = self.reconnect.jittered_delay(attempt);
        debug!(
            epoch,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "ws: reconnect scheduled"
        );
        let manager = Arc::downgrade(self);
        self.reconnect_timer.schedule(delay, async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Detached so the next attempt can reuse the timer slot without
            // aborting this one.
            tokio::spawn(async move { manager.reconnect_attempt(epoch).await });
        });
    }

    async fn reconnect_attempt(self: Arc<Self>, expected_epoch: u64) {
        let (epoch, force_refresh) = {
            let mut inner = lock(&self.inner);
            if inner.epoch != expected_epoch
                || !matches!(inner.state, ConnectionState::Reconnecting { .. })
            {
                return;
            }
            let force_refresh = std::mem::take(&mut inner.force_refresh_next);
            (begin_attempt(&mut inner), force_refresh)
        };
        self.emit_state(ConnectionState::Connecting, epoch);
        if let Err(err) = self
            .establish(epoch, AttemptKind::Reconnect { force_refresh })
            .await
        {
            debug!(epoch, "ws: reconnect attempt failed: {err}");
        }
    }

    fn emit_state(&self, state: ConnectionState, epoch: u64) {
        self.events
            .emit(&ConnectionEvent::StateChanged { state, epoch });
    }
}

fn begin_attempt(inner: &mut ConnectionInner) -> u64 {
    inner.epoch += 1;
    inner.state = ConnectionState::Connecting;
    inner.buffer.clear();
    inner.outbound = None;
    if let Some(reader) = inner.reader.take() {
        reader.abort();
    }
    inner.epoch
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
