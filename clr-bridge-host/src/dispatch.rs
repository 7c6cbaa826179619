//! Hook dispatcher
//!
//! Forwards a server event to the delegate bound for it:
//!
//! 1. Skip (`Noop`) if the session is not live or the hook has no delegate
//!    resolved by this session
//! 2. Serialize a [`RequestEnvelope`] to MessagePack
//! 3. Call the delegate with the request buffer and a fresh reply buffer
//! 4. Validate the return code and reply length
//! 5. Decode the [`HookResponse`] and merge it into the request context
//!
//! Both buffers are owned by the host and live only for the duration of the
//! call. Any failure along the way is logged and reported as `Fail`.

use crate::hooks::HookTable;
use crate::loader::{Delegate, HostApi};
use crate::session::RuntimeSession;
use clr_bridge_api::{
    Hook, HookResponse, Outcome, RequestContext, RequestEnvelope, DEFAULT_REPLY_BUFFER_SIZE,
};
use thiserror::Error;

/// Errors that can occur while invoking a delegate
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    #[error("Request of {0} bytes exceeds the delegate ABI limit")]
    RequestTooLarge(usize),

    #[error("Delegate returned unknown outcome code {0}")]
    InvalidCode(i32),

    #[error("Delegate reported reply length {len} for a buffer of {capacity} bytes")]
    InvalidReplyLength { len: i32, capacity: usize },

    #[error("Delegate returned an attribute with an empty name (value {0:?})")]
    InvalidAttribute(String),
}

/// Invokes bound delegates and maps their results to [`Outcome`]s
#[derive(Debug, Clone)]
pub struct Dispatcher {
    reply_buffer_size: usize,
}

impl Dispatcher {
    /// Create a dispatcher with the given reply buffer size.
    ///
    /// The size is clamped to `1..=i32::MAX`.
    pub fn new(reply_buffer_size: usize) -> Self {
        Self {
            reply_buffer_size: reply_buffer_size.clamp(1, i32::MAX as usize),
        }
    }

    /// Size of the reply buffer handed to each delegate
    pub fn reply_buffer_size(&self) -> usize {
        self.reply_buffer_size
    }

    /// Dispatch one event.
    ///
    /// Returns `Noop` without touching the runtime if the session is not live
    /// or `hook` has no delegate resolved by this session.
    pub fn dispatch<H: HostApi>(
        &self,
        table: &HookTable,
        session: &RuntimeSession<H>,
        hook: Hook,
        ctx: &mut RequestContext,
    ) -> Outcome {
        if !session.is_live() {
            tracing::debug!(
                hook = %hook,
                status = %session.status(),
                "Session not live, skipping hook"
            );
            return Outcome::Noop;
        }

        let Some(delegate) = table.delegate(hook, session.id()) else {
            tracing::trace!(hook = %hook, "Hook not bound for this session");
            return Outcome::Noop;
        };

        match self.invoke(delegate, hook, ctx) {
            Ok(outcome) => {
                tracing::debug!(
                    hook = %hook,
                    request = ctx.number,
                    outcome = %outcome,
                    "Hook returned"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(
                    hook = %hook,
                    request = ctx.number,
                    target = %table.descriptor(hook),
                    error = %e,
                    "Hook dispatch failed"
                );
                Outcome::Fail
            }
        }
    }

    fn invoke(
        &self,
        delegate: Delegate,
        hook: Hook,
        ctx: &mut RequestContext,
    ) -> Result<Outcome, DispatchError> {
        // 1. Serialize request
        let request = rmp_serde::to_vec_named(&RequestEnvelope::new(hook, ctx))
            .map_err(DispatchError::Serialization)?;
        let request_len = i32::try_from(request.len())
            .map_err(|_| DispatchError::RequestTooLarge(request.len()))?;

        // 2. Allocate reply buffer
        let mut reply = vec![0u8; self.reply_buffer_size];
        let reply_cap = i32::try_from(reply.len()).unwrap_or(i32::MAX);
        let mut reply_len: i32 = 0;

        // 3. Call delegate
        // SAFETY: the dispatcher only runs while the session is live, and every
        // buffer passed here outlives the call.
        let code = unsafe {
            let hook_fn = delegate.as_hook_fn();
            hook_fn(
                request.as_ptr(),
                request_len,
                reply.as_mut_ptr(),
                reply_cap,
                &mut reply_len,
            )
        };

        // 4. Validate
        let outcome = Outcome::from_code(code).ok_or(DispatchError::InvalidCode(code))?;
        let len = usize::try_from(reply_len)
            .ok()
            .filter(|len| *len <= reply.len())
            .ok_or(DispatchError::InvalidReplyLength {
                len: reply_len,
                capacity: reply.len(),
            })?;

        // 5. Decode and merge updates
        if len > 0 {
            let response: HookResponse =
                rmp_serde::from_slice(&reply[..len]).map_err(DispatchError::Deserialization)?;
            if let Some(attr) = response.invalid_attribute() {
                return Err(DispatchError::InvalidAttribute(attr.value.clone()));
            }
            ctx.apply(response);
        }

        Ok(outcome)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_BUFFER_SIZE)
    }
}
