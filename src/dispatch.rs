//! The dispatch controller: identity, limiter, session, gateway, history.
//!
//! `handle()` is invoked once per inbound message. Order matters:
//! the single-flight check comes first (a busy session never consults the
//! limiter), the limiter second (a rejection leaves history untouched), and
//! only an admitted request appends to history and reaches the backend.

use std::sync::Arc;

use tracing::{info, warn};

use crate::gateway::{Gateway, GatewayError};
use crate::limiter::SlidingWindowLimiter;
use crate::session::{Message, SessionStore};

/// Result of one `handle()` call. The HTTP layer renders every variant.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Admitted; the assistant message that was appended to history.
    /// Covers degraded successes (default text substituted).
    Reply(Message),
    /// Admitted, but the backend call hard-failed. No assistant message was
    /// appended and the user's message was rolled back.
    Failed(GatewayError),
    /// Rejected before dispatch: the identity exhausted its window budget.
    RateLimited,
    /// Rejected before dispatch: a request for this session is in flight.
    Busy,
}

/// Orchestrates one conversational turn end to end.
///
/// Every collaborator is an injected handle; tests build isolated
/// controllers with mock gateways and private limiters.
pub struct DispatchController {
    limiter: Arc<SlidingWindowLimiter>,
    sessions: Arc<SessionStore>,
    gateway: Arc<dyn Gateway>,
}

impl DispatchController {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        sessions: Arc<SessionStore>,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self {
            limiter,
            sessions,
            gateway,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    /// Handle one inbound user message for a session.
    ///
    /// The session returns to `Idle` on every path: the flight guard releases
    /// on drop, including early returns and panics. If the session is reset
    /// while the backend call is in flight, the result is still returned to
    /// the caller but discarded from the fresh session's history.
    pub async fn handle(&self, session_id: &str, identity: &str, text: &str) -> DispatchOutcome {
        let session = self.sessions.get_or_create(session_id).await;

        // 1. Session-local single-flight. A busy session does not consult
        //    the limiter; the caller is told to wait, not penalized.
        let Some(guard) = session.try_begin() else {
            info!(session_id = %session_id, "request rejected, session busy");
            return DispatchOutcome::Busy;
        };

        // 2. Shared rate limit. Rejection is free of side effects on the
        //    conversation record; the guard drop returns the session to Idle.
        if !self.limiter.try_admit(identity).await {
            return DispatchOutcome::RateLimited;
        }

        // 3. Record the user's message. Applies only if the session has not
        //    been reset since the flight began.
        let epoch = guard.epoch();
        session.append(epoch, Message::user(text)).await;

        // 4. One backend call, no locks held. A slow call blocks only this
        //    session.
        let result = self.gateway.send(text, session_id).await;

        // 5./6. Apply the outcome. All history mutations are epoch-checked,
        //    so a reset in between turns them into no-ops.
        match result {
            Ok(reply) => {
                let message = Message::assistant(reply.text);
                let applied = session.append(epoch, message.clone()).await;
                info!(
                    session_id = %session_id,
                    degraded = reply.degraded,
                    applied,
                    "assistant reply dispatched"
                );
                DispatchOutcome::Reply(message)
            }
            Err(err) => {
                // Hard failure: no assistant message; take the user's text
                // back out so they can resend it.
                session.rollback_last_user(epoch).await;
                warn!(
                    session_id = %session_id,
                    kind = err.kind(),
                    "backend call failed, user message rolled back"
                );
                DispatchOutcome::Failed(err)
            }
        }
        // 7. `guard` drops here and the session is Idle again.
    }
}
