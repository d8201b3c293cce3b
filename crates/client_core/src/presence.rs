use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::ServerEvent};
use tracing::{debug, info};

use crate::{
    connection::{ConnectionEvent, ConnectionState},
    lock,
    subscription::{EventHub, Subscription},
    timer::TimerSlot,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    pub users: BTreeSet<UserId>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Who joined and who left between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    pub joined: Vec<UserId>,
    pub left: Vec<UserId>,
}

impl PresenceDelta {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Online-user set maintained from full `online-users` snapshots.
///
/// Losing the connection keeps the last snapshot visible; it is only
/// cleared once the connection has stayed down for the staleness window.
pub struct PresenceTracker {
    current: Mutex<PresenceSet>,
    staleness: Duration,
    stale_timer: TimerSlot,
    events: EventHub<PresenceDelta>,
}

impl PresenceTracker {
    pub fn new(staleness: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(PresenceSet::default()),
            staleness,
            stale_timer: TimerSlot::new(),
            events: EventHub::new(),
        })
    }

    pub fn subscribe(&self, handler: impl Fn(&PresenceDelta) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    pub fn snapshot(&self) -> PresenceSet {
        lock(&self.current).clone()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        lock(&self.current).users.contains(user_id)
    }

    pub fn online_count(&self) -> usize {
        lock(&self.current).users.len()
    }

    pub fn handle_connection_event(self: &Arc<Self>, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound {
                event: ServerEvent::OnlineUsers(users),
                ..
            } => {
                self.apply_snapshot(users.iter().cloned());
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Authenticated,
                ..
            } => {
                if self.stale_timer.cancel() {
                    debug!("presence: connection restored before snapshot went stale");
                }
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Disconnected | ConnectionState::Reconnecting { .. },
                ..
            } => self.arm_staleness(),
            _ => {}
        }
    }

    /// Replaces the whole set and publishes the difference.
    pub fn apply_snapshot(&self, users: impl IntoIterator<Item = UserId>) -> PresenceDelta {
        let next: BTreeSet<UserId> = users.into_iter().collect();
        let delta = {
            let mut current = lock(&self.current);
            let delta = PresenceDelta {
                joined: next.difference(&current.users).cloned().collect(),
                left: current.users.difference(&next).cloned().collect(),
            };
            current.users = next;
            current.updated_at = Some(Utc::now());
            delta
        };

        if !delta.is_empty() {
            debug!(
                joined = delta.joined.len(),
                left = delta.left.len(),
                "presence: snapshot applied"
            );
            self.events.emit(&delta);
        }
        delta
    }

    /// Drops the set immediately, e.g. at logout.
    pub fn clear(&self) {
        self.stale_timer.cancel();
        self.expire();
    }

    fn arm_staleness(self: &Arc<Self>) {
        if self.stale_timer.is_pending() {
            return;
        }
        let tracker = Arc::downgrade(self);
        self.stale_timer.schedule(self.staleness, async move {
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire();
            }
        });
    }

    fn expire(&self) {
        let left: Vec<UserId> = {
            let mut current = lock(&self.current);
            current.updated_at = Some(Utc::now());
            std::mem::take(&mut current.users).into_iter().collect()
        };
        if left.is_empty() {
            return;
        }
        info!(cleared = left.len(), "presence: snapshot went stale; clearing");
        self.events.emit(&PresenceDelta {
            joined: Vec::new(),
            left,
        });
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
