use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use shared::domain::Credential;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub mod cache;
pub mod call;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod presence;
pub mod refresh;
pub mod subscription;
pub mod timer;
pub mod transport;

pub use cache::{CacheEntry, CacheKey, ReactiveCache};
pub use call::{CallSession, CallSignalingMachine, CallState, SignalOutcome, SignalSender};
pub use config::{load_settings, ClientSettings, ReconnectConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use credential::CredentialStore;
pub use error::{CacheError, CallError, ClientError, ConnectionError, ErrorClass, RefreshError};
pub use presence::{PresenceDelta, PresenceSet, PresenceTracker};
pub use refresh::{HttpRefreshTransport, RefreshTransport, SessionEvent, TokenRefreshCoordinator};
pub use subscription::{EventHub, Subscription};
pub use transport::{SocketConnector, SocketLink, WsConnector};

/// Cache domain invalidated whenever the online set changes.
pub const PRESENCE_CACHE_DOMAIN: &str = "presence";
/// Cache domain invalidated whenever a call reaches a terminal state.
pub const CALLS_CACHE_DOMAIN: &str = "calls";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// A panicking handler must not wedge the whole client, so poisoned locks are
// recovered rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// What the UI layer observes.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connection(ConnectionState),
    /// Events received before the auth ack were discarded.
    EventsDropped { count: usize },
    Presence(PresenceDelta),
    Call(CallSession),
    Session(SessionEvent),
}

/// Owns every component of one signed-in session.
///
/// Created at session start and torn down with [`SessionCoordinator::logout`].
/// Connection events fan out to the presence tracker, then the call machine,
/// then the UI event stream.
pub struct SessionCoordinator<V = serde_json::Value> {
    settings: ClientSettings,
    credentials: Arc<CredentialStore>,
    refresh: Arc<TokenRefreshCoordinator>,
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceTracker>,
    calls: Arc<CallSignalingMachine>,
    cache: Arc<ReactiveCache<V>>,
    events: broadcast::Sender<ClientEvent>,
    _subscriptions: Vec<Subscription>,
}

impl<V> SessionCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Wires the HTTP refresh endpoint and the websocket transport from
    /// `settings`.
    pub fn new(settings: ClientSettings) -> Result<Arc<Self>, ClientError> {
        let refresh_transport = Arc::new(
            HttpRefreshTransport::new(settings.server_url.clone()).with_timeout(settings.request_timeout),
        );
        let connector = Arc::new(WsConnector::new(&settings.server_url, &settings.ws_path)?);
        Ok(Self::with_transports(settings, refresh_transport, connector))
    }

    pub fn with_transports(
        settings: ClientSettings,
        refresh_transport: Arc<dyn RefreshTransport>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        let credentials = Arc::new(CredentialStore::new());
        let refresh = TokenRefreshCoordinator::new(
            Arc::clone(&credentials),
            refresh_transport,
            settings.refresh_margin,
            settings.request_timeout,
        );
        let connection = ConnectionManager::new(
            Arc::clone(&refresh),
            connector,
            settings.reconnect.clone(),
            settings.event_buffer_capacity,
            settings.auth_ack_timeout,
        );
        let presence = PresenceTracker::new(settings.presence_staleness);
        let signal_sender: Arc<dyn SignalSender> = connection.clone();
        let calls = CallSignalingMachine::new(signal_sender, settings.ring_timeout);
        let cache = ReactiveCache::new(settings.cache_stale_time);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let subscriptions = vec![
            wire_connection(&connection, &presence, &calls, &events),
            wire_presence(&presence, &cache, &events),
            wire_calls(&calls, &cache, &events),
            wire_session(&refresh, &events),
        ];

        Arc::new(Self {
            settings,
            credentials,
            refresh,
            connection,
            presence,
            calls,
            cache,
            events,
            _subscriptions: subscriptions,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn refresh(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.refresh
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn calls(&self) -> &Arc<CallSignalingMachine> {
        &self.calls
    }

    pub fn cache(&self) -> &Arc<ReactiveCache<V>> {
        &self.cache
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Seeds the store with the credential obtained at sign-in, then
    /// connects. With `None` the first connect refreshes from the server
    /// session instead.
    pub async fn start(&self, credential: Option<Credential>) -> Result<(), ClientError> {
        if let Some(credential) = credential {
            self.credentials.set(credential);
        }
        self.connection.connect().await?;
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Disconnects, cancels every timer and forgets all session state.
    pub fn logout(&self) {
        info!("session: logging out");
        self.connection.disconnect();
        self.refresh.shutdown();
        self.credentials.clear();
        self.presence.clear();
        self.cache.clear();
        debug!("session: state cleared");
    }
}

fn wire_connection(
    connection: &Arc<ConnectionManager>,
    presence: &Arc<PresenceTracker>,
    calls: &Arc<CallSignalingMachine>,
    events: &broadcast::Sender<ClientEvent>,
) -> Subscription {
    let presence = Arc::downgrade(presence);
    let calls = Arc::downgrade(calls);
    let events = events.clone();
    connection.subscribe(move |event| {
        if let Some(presence) = presence.upgrade() {
            presence.handle_connection_event(event);
        }
        if let Some(calls) = calls.upgrade() {
            calls.handle_connection_event(event);
        }
        match event {
            ConnectionEvent::StateChanged { state, .. } => {
                let _ = events.send(ClientEvent::Connection(*state));
            }
            ConnectionEvent::EventsDropped { count, .. } => {
                let _ = events.send(ClientEvent::EventsDropped { count: *count });
            }
            ConnectionEvent::Inbound { .. } => {}
        }
    })
}

fn wire_presence<V>(
    presence: &Arc<PresenceTracker>,
    cache: &Arc<ReactiveCache<V>>,
    events: &broadcast::Sender<ClientEvent>,
) -> Subscription
where
    V: Clone + Send + Sync + 'static,
{
    let cache = Arc::downgrade(cache);
    let events = events.clone();
    presence.subscribe(move |delta| {
        if let Some(cache) = cache.upgrade() {
            cache.invalidate_prefix(&CacheKey::from([PRESENCE_CACHE_DOMAIN]));
        }
        let _ = events.send(ClientEvent::Presence(delta.clone()));
    })
}

fn wire_calls<V>(
    calls: &Arc<CallSignalingMachine>,
    cache: &Arc<ReactiveCache<V>>,
    events: &broadcast::Sender<ClientEvent>,
) -> Subscription
where
    V: Clone + Send + Sync + 'static,
{
    let cache = Arc::downgrade(cache);
    let events = events.clone();
    calls.subscribe(move |session| {
        if session.state.is_terminal() {
            if let Some(cache) = cache.upgrade() {
                cache.invalidate_prefix(&CacheKey::from([CALLS_CACHE_DOMAIN]));
            }
        }
        let _ = events.send(ClientEvent::Call(session.clone()));
    })
}

fn wire_session(
    refresh: &Arc<TokenRefreshCoordinator>,
    events: &broadcast::Sender<ClientEvent>,
) -> Subscription {
    let events = events.clone();
    refresh.subscribe(move |event| {
        let _ = events.send(ClientEvent::Session(event.clone()));
    })
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
