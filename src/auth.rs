//! Per-session AUTH interceptor.
//!
//! Wraps [`crate::resp::recognize`] with the one-shot state machine
//! required by the spec: the first successfully rewritten AUTH/HELLO
//! frame flips `active` to `false` for the remainder of the session, so
//! a client that later issues `ACL SETUSER ... AUTH ...` or re-sends
//! `AUTH` is forwarded verbatim rather than rewritten again.

use std::sync::Arc;

use crate::config::Config;
use crate::resp::{recognize, RecognizeOutcome};

/// Outcome of feeding one buffer through the interceptor.
pub enum InterceptOutcome {
    /// Forward `bytes` to upstream as-is (either passthrough, or `active`
    /// had already been cleared by a previous frame).
    Forward(Vec<u8>),
    /// The AUTH/HELLO password did not match; write this back to the
    /// client and end the session without forwarding anything upstream.
    AuthFailed(&'static [u8]),
}

/// Per-session wrapper over the stateless recognizer.
pub struct AuthInterceptor {
    config: Arc<Config>,
    active: bool,
}

impl AuthInterceptor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, active: true }
    }

    /// True until the first AUTH/HELLO frame has been rewritten.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one buffer read from the client through the interceptor.
    pub fn intercept(&mut self, buf: &[u8]) -> InterceptOutcome {
        if !self.active {
            return InterceptOutcome::Forward(buf.to_vec());
        }

        match recognize(buf, &self.config) {
            RecognizeOutcome::Passthrough => InterceptOutcome::Forward(buf.to_vec()),
            RecognizeOutcome::Rewritten(rewritten) => {
                self.active = false;
                InterceptOutcome::Forward(rewritten)
            }
            RecognizeOutcome::AuthFailed => {
                self.active = false;
                InterceptOutcome::AuthFailed(crate::resp::INVALID_PASSWORD_REPLY)
            }
        }
    }
}
