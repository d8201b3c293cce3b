use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CallDirection, CallId, CallKind, UserId},
    protocol::{CallSignal, ClientRequest, RejectReason, SignalKind},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionEvent, ConnectionManager, ConnectionState},
    error::{CallError, ConnectionError},
    lock,
    subscription::{EventHub, Subscription},
    timer::TimerSlot,
};

/// Outbound path for call signals.
pub trait SignalSender: Send + Sync {
    fn send_signal(&self, request: ClientRequest) -> Result<(), ConnectionError>;
}

impl SignalSender for ConnectionManager {
    fn send_signal(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        self.send(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing(CallDirection),
    Connected,
    Ended,
    Rejected,
    Missed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Rejected | CallState::Missed | CallState::Failed
        )
    }

    /// Ringing or connected.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != CallState::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub kind: CallKind,
    pub peer_id: UserId,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// What an inbound signal did to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied(CallState),
    RejectedBusy,
    /// Already processed (sequence number not newer).
    Duplicate,
    /// Refers to a call other than the active one.
    Stale,
    /// Valid call, but no transition applies from the current state.
    Ignored,
}

struct ActiveCall {
    session: CallSession,
    last_inbound_seq: Option<u64>,
    next_outbound_seq: u64,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            last_inbound_seq: None,
            next_outbound_seq: 1,
        }
    }

    fn outbound(&mut self, kind: SignalKind, reason: Option<RejectReason>) -> ClientRequest {
        let seq = self.next_outbound_seq;
        self.next_outbound_seq += 1;
        ClientRequest::signal(
            kind,
            CallSignal {
                call_id: self.session.call_id.clone(),
                seq,
                kind: self.session.kind,
                peer_id: self.session.peer_id.clone(),
                reason,
            },
        )
    }

    fn transition(&mut self, next: CallState) {
        self.session.state = next;
        if next.is_terminal() && self.session.ended_at.is_none() {
            self.session.ended_at = Some(Utc::now());
        }
    }

    fn is_duplicate(&self, seq: u64) -> bool {
        self.last_inbound_seq.is_some_and(|last| seq <= last)
    }
}

/// Side effects collected under the lock and run after it is released.
#[derive(Default)]
struct Effects {
    session: Option<CallSession>,
    outbound: Option<ClientRequest>,
    arm_ring_timer: Option<CallId>,
}

/// Tracks the single active call and its signaling state.
///
/// This never negotiates media; collaborators observe `Connected` and
/// `Ended` transitions through [`CallSignalingMachine::subscribe`].
pub struct CallSignalingMachine {
    sender: Arc<dyn SignalSender>,
    ring_timeout: Duration,
    active: Mutex<Option<ActiveCall>>,
    ring_timer: TimerSlot,
    events: EventHub<CallSession>,
}

impl CallSignalingMachine {
    pub fn new(sender: Arc<dyn SignalSender>, ring_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sender,
            ring_timeout,
            active: Mutex::new(None),
            ring_timer: TimerSlot::new(),
            events: EventHub::new(),
        })
    }

    pub fn subscribe(&self, handler: impl Fn(&CallSession) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    pub fn current(&self) -> Option<CallSession> {
        lock(&self.active).as_ref().map(|call| call.session.clone())
    }

    pub fn state(&self) -> CallState {
        lock(&self.active)
            .as_ref()
            .map_or(CallState::Idle, |call| call.session.state)
    }

    pub fn handle_connection_event(self: &Arc<Self>, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound { event, .. } => {
                if let Some((kind, signal)) = event.call_signal() {
                    self.handle_signal(kind, signal);
                }
            }
            ConnectionEvent::StateChanged {
                state: ConnectionState::Disconnected,
                ..
            } => self.fail_active(),
            _ => {}
        }
    }

    pub fn handle_signal(self: &Arc<Self>, kind: SignalKind, signal: &CallSignal) -> SignalOutcome {
        let mut effects = Effects::default();
        let outcome = {
            let mut active = lock(&self.active);
            match kind {
                SignalKind::Offer => on_offer(&mut active, signal, &mut effects),
                _ => on_peer_signal(&mut active, kind, signal, &mut effects),
            }
        };

        match outcome {
            SignalOutcome::Applied(state) => {
                info!(call_id = %signal.call_id, seq = signal.seq, "call: {} -> {state:?}", kind.as_str())
            }
            SignalOutcome::RejectedBusy => {
                info!(call_id = %signal.call_id, "call: offer rejected, busy")
            }
            other => debug!(
                call_id = %signal.call_id,
                seq = signal.seq,
                "call: {} not applied: {other:?}",
                kind.as_str()
            ),
        }

        self.run_effects(effects);
        outcome
    }

    /// Places an outgoing call. Fails without side effects if the offer
    /// cannot be sent.
    pub fn start_call(
        self: &Arc<Self>,
        peer_id: UserId,
        kind: CallKind,
    ) -> Result<CallSession, CallError> {
        let session = {
            let mut active = lock(&self.active);
            if active.as_ref().is_some_and(|call| call.session.state.is_active()) {
                return Err(CallError::Busy);
            }
            let mut call = ActiveCall::new(CallSession {
                call_id: CallId::generate(),
                direction: CallDirection::Outgoing,
                kind,
                peer_id,
                state: CallState::Ringing(CallDirection::Outgoing),
                started_at: Utc::now(),
                ended_at: None,
            });
            let offer = call.outbound(SignalKind::Offer, None);
            self.sender.send_signal(offer)?;
            info!(call_id = %call.session.call_id, peer_id = %call.session.peer_id, "call: outgoing call started");
            let session = call.session.clone();
            *active = Some(call);
            session
        };
        self.run_effects(Effects {
            session: Some(session.clone()),
            outbound: None,
            arm_ring_timer: Some(session.call_id.clone()),
        });
        Ok(session)
    }

    /// Answers the ringing incoming call.
    pub fn accept_call(self: &Arc<Self>) -> Result<CallSession, CallError> {
        let session = {
            let mut active = lock(&self.active);
            let call = match active.as_mut() {
                Some(call) if call.session.state == CallState::Ringing(CallDirection::Incoming) => call,
                other => {
                    return Err(CallError::InvalidTransition {
                        from: other.map_or(CallState::Idle, |call| call.session.state),
                        action: "accept",
                    })
                }
            };
            let accept = call.outbound(SignalKind::Accept, None);
            self.sender.send_signal(accept)?;
            call.transition(CallState::Connected);
            info!(call_id = %call.session.call_id, "call: accepted");
            call.session.clone()
        };
        self.ring_timer.cancel();
        self.run_effects(Effects {
            session: Some(session.clone()),
            ..Effects::default()
        });
        Ok(session)
    }

    pub fn reject_call(self: &Arc<Self>) -> Result<CallSession, CallError> {
        self.finish_locally(SignalKind::Reject, CallState::Rejected, "reject")
    }

    pub fn hang_up(self: &Arc<Self>) -> Result<CallSession, CallError> {
        self.finish_locally(SignalKind::End, CallState::Ended, "hang up")
    }

    /// Local state moves first; the outbound signal is best-effort.
    fn finish_locally(
        self: &Arc<Self>,
        signal: SignalKind,
        next: CallState,
        action: &'static str,
    ) -> Result<CallSession, CallError> {
        let mut effects = Effects::default();
        let session = {
            let mut active = lock(&self.active);
            let call = match active.as_mut() {
                Some(call) if call.session.state.is_active() => call,
                other => {
                    return Err(CallError::InvalidTransition {
                        from: other.map_or(CallState::Idle, |call| call.session.state),
                        action,
                    })
                }
            };
            call.transition(next);
            let reason = (signal == SignalKind::Reject).then_some(RejectReason::Declined);
            effects.outbound = Some(call.outbound(signal, reason));
            info!(call_id = %call.session.call_id, "call: {action} -> {next:?}");
            call.session.clone()
        };
        effects.session = Some(session.clone());
        self.run_effects(effects);
        Ok(session)
    }

    fn fail_active(self: &Arc<Self>) {
        let mut effects = Effects::default();
        {
            let mut active = lock(&self.active);
            if let Some(call) = active.as_mut().filter(|call| call.session.state.is_active()) {
                warn!(call_id = %call.session.call_id, "call: connection lost; call failed");
                call.transition(CallState::Failed);
                effects.session = Some(call.session.clone());
            }
        }
        self.run_effects(effects);
    }

    fn ring_expired(self: &Arc<Self>, call_id: &CallId) {
        let mut effects = Effects::default();
        {
            let mut active = lock(&self.active);
            let Some(call) = active
                .as_mut()
                .filter(|call| &call.session.call_id == call_id)
            else {
                return;
            };
            let CallState::Ringing(direction) = call.session.state else {
                return;
            };
            info!(call_id = %call_id, ?direction, "call: ring timeout; missed");
            call.transition(CallState::Missed);
            if direction == CallDirection::Outgoing {
                effects.outbound = Some(call.outbound(SignalKind::End, None));
            }
            effects.session = Some(call.session.clone());
        }
        self.run_effects(effects);
    }

    fn run_effects(self: &Arc<Self>, effects: Effects) {
        if let Some(call_id) = effects.arm_ring_timer {
            self.arm_ring_timer(call_id);
        }
        if let Some(request) = effects.outbound {
            if let Err(err) = self.sender.send_signal(request) {
                warn!("call: best-effort signal not sent: {err}");
            }
        }
        if let Some(session) = effects.session {
            if session.state.is_terminal() {
                self.ring_timer.cancel();
            }
            self.events.emit(&session);
        }
    }

    fn arm_ring_timer(self: &Arc<Self>, call_id: CallId) {
        let machine = Arc::downgrade(self);
        self.ring_timer.schedule(self.ring_timeout, async move {
            if let Some(machine) = machine.upgrade() {
                machine.ring_expired(&call_id);
            }
        });
    }
}

fn on_offer(
    active: &mut Option<ActiveCall>,
    signal: &CallSignal,
    effects: &mut Effects,
) -> SignalOutcome {
    if let Some(call) = active.as_mut() {
        if call.session.call_id == signal.call_id {
            if call.is_duplicate(signal.seq) {
                return SignalOutcome::Duplicate;
            }
            call.last_inbound_seq = Some(signal.seq);
            return SignalOutcome::Ignored;
        }
        if call.session.state.is_active() {
            effects.outbound = Some(ClientRequest::CallReject(CallSignal {
                call_id: signal.call_id.clone(),
                seq: 1,
                kind: signal.kind,
                peer_id: signal.peer_id.clone(),
                reason: Some(RejectReason::Busy),
            }));
            return SignalOutcome::RejectedBusy;
        }
    }

    let mut call = ActiveCall::new(CallSession {
        call_id: signal.call_id.clone(),
        direction: CallDirection::Incoming,
        kind: signal.kind,
        peer_id: signal.peer_id.clone(),
        state: CallState::Ringing(CallDirection::Incoming),
        started_at: Utc::now(),
        ended_at: None,
    });
    call.last_inbound_seq = Some(signal.seq);
    effects.session = Some(call.session.clone());
    effects.arm_ring_timer = Some(call.session.call_id.clone());
    *active = Some(call);
    SignalOutcome::Applied(CallState::Ringing(CallDirection::Incoming))
}

fn on_peer_signal(
    active: &mut Option<ActiveCall>,
    kind: SignalKind,
    signal: &CallSignal,
    effects: &mut Effects,
) -> SignalOutcome {
    let Some(call) = active
        .as_mut()
        .filter(|call| call.session.call_id == signal.call_id)
    else {
        return SignalOutcome::Stale;
    };
    if call.is_duplicate(signal.seq) {
        return SignalOutcome::Duplicate;
    }
    call.last_inbound_seq = Some(signal.seq);

    let state = call.session.state;
    if state.is_terminal() {
        return SignalOutcome::Ignored;
    }

    let next = match (kind, state) {
        (SignalKind::Accept, CallState::Ringing(CallDirection::Outgoing)) => CallState::Connected,
        (SignalKind::Reject, CallState::Ringing(CallDirection::Outgoing)) => CallState::Rejected,
        (SignalKind::Reject, CallState::Ringing(CallDirection::Incoming)) => CallState::Missed,
        (SignalKind::Reject, CallState::Connected) => CallState::Ended,
        (SignalKind::End, CallState::Ringing(_) | CallState::Connected) => CallState::Ended,
        _ => return SignalOutcome::Ignored,
    };
    call.transition(next);
    effects.session = Some(call.session.clone());
    SignalOutcome::Applied(next)
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
