//! Runtime host session
//!
//! Owns the lifecycle of exactly one embedded runtime instance:
//!
//! ```text
//! Loaded ──initialize──▶ Initialized ──shutdown──▶ Shutdown
//!                          │    ▲
//!                          └────┘ create_delegate
//! ```
//!
//! Out-of-order calls are rejected with a [`SessionError`] and leave the state
//! untouched. `Shutdown` is terminal.

use crate::loader::{Delegate, DomainId, HostApi, HostHandle};
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Startup property naming the assemblies the runtime may load
pub const TRUSTED_PLATFORM_ASSEMBLIES: &str = "TRUSTED_PLATFORM_ASSEMBLIES";

/// Startup property naming the application probing paths
pub const APP_PATHS: &str = "APP_PATHS";

/// Process-unique identity of a [`RuntimeSession`]
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Property key/value count mismatch: {keys} keys, {values} values")]
    PropertyMismatch { keys: usize, values: usize },

    #[error("Runtime session is already initialized")]
    AlreadyInitialized,

    #[error("Runtime session is not initialized")]
    NotInitialized,

    #[error("Runtime session has been shut down")]
    ShutDown,

    #[error("Runtime initialization failed: 0x{0:08X}")]
    InitFailed(i32),

    #[error("Failed to bind {target}: host returned 0x{code:08X}")]
    BindFailed { target: String, code: i32 },

    #[error("Runtime shutdown returned 0x{0:08X}")]
    ShutdownFailed(i32),

    #[error("Invalid string for {field}: contains an interior NUL byte")]
    InvalidString { field: &'static str },
}

/// Observable lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Loaded,
    Initialized,
    Shutdown,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Loaded => "loaded",
            SessionStatus::Initialized => "initialized",
            SessionStatus::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

enum State {
    Loaded,
    Initialized { host: HostHandle, domain: DomainId },
    Shutdown,
}

/// Ordered startup properties passed to `initialize`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupProperties {
    entries: Vec<(String, String)>,
}

impl StartupProperties {
    /// Create an empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing an earlier value for the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Value of a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Property keys, in insertion order
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Property values, parallel to [`keys`](Self::keys)
    pub fn values(&self) -> Vec<&str> {
        self.entries.iter().map(|(_, v)| v.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One embedded runtime instance and its host-API capability
///
/// Not thread-safe: callers must serialize access, e.g. through
/// [`SharedModule`](crate::SharedModule).
pub struct RuntimeSession<H: HostApi> {
    id: SessionId,
    state: State,
    host_api: H,
}

impl<H: HostApi> RuntimeSession<H> {
    /// Wrap a resolved host API; the session starts in `Loaded`
    pub fn new(host_api: H) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: State::Loaded,
            host_api,
        }
    }

    /// Identity of this session; delegates it creates are only valid for it
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        match self.state {
            State::Loaded => SessionStatus::Loaded,
            State::Initialized { .. } => SessionStatus::Initialized,
            State::Shutdown => SessionStatus::Shutdown,
        }
    }

    /// Whether delegates created by this session may be invoked
    pub fn is_live(&self) -> bool {
        matches!(self.state, State::Initialized { .. })
    }

    /// Domain id of the live execution context
    pub fn domain_id(&self) -> Option<DomainId> {
        match self.state {
            State::Initialized { domain, .. } => Some(domain),
            _ => None,
        }
    }

    /// The host API this session drives
    pub fn host_api(&self) -> &H {
        &self.host_api
    }

    /// Start the runtime.
    ///
    /// `keys` and `values` are parallel sequences; a length mismatch is
    /// rejected before the runtime is touched.
    pub fn initialize(
        &mut self,
        app_base_path: &str,
        app_name: &str,
        keys: &[&str],
        values: &[&str],
    ) -> Result<(), SessionError> {
        match self.state {
            State::Loaded => {}
            State::Initialized { .. } => return Err(SessionError::AlreadyInitialized),
            State::Shutdown => return Err(SessionError::ShutDown),
        }

        if keys.len() != values.len() {
            return Err(SessionError::PropertyMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }

        let app_base_path = c_string("app_base_path", app_base_path)?;
        let app_name = c_string("app_name", app_name)?;
        let keys = keys
            .iter()
            .map(|k| c_string("property key", k))
            .collect::<Result<Vec<_>, _>>()?;
        let values = values
            .iter()
            .map(|v| c_string("property value", v))
            .collect::<Result<Vec<_>, _>>()?;
        let key_refs: Vec<&CStr> = keys.iter().map(CString::as_c_str).collect();
        let value_refs: Vec<&CStr> = values.iter().map(CString::as_c_str).collect();

        let (host, domain) = self
            .host_api
            .initialize(&app_base_path, &app_name, &key_refs, &value_refs)
            .map_err(|code| {
                tracing::error!(code = %format!("0x{code:08X}"), "Runtime initialization failed");
                SessionError::InitFailed(code)
            })?;

        self.state = State::Initialized { host, domain };
        tracing::info!(domain_id = domain, properties = keys.len(), "Runtime initialized");
        Ok(())
    }

    /// Start the runtime with a prepared property set
    pub fn initialize_with(
        &mut self,
        app_base_path: &str,
        app_name: &str,
        properties: &StartupProperties,
    ) -> Result<(), SessionError> {
        self.initialize(
            app_base_path,
            app_name,
            &properties.keys(),
            &properties.values(),
        )
    }

    /// Resolve a managed function into a delegate usable until shutdown
    pub fn create_delegate(
        &self,
        assembly: &str,
        class: &str,
        function: &str,
    ) -> Result<Delegate, SessionError> {
        let (host, domain) = match self.state {
            State::Initialized { host, domain } => (host, domain),
            State::Loaded => return Err(SessionError::NotInitialized),
            State::Shutdown => return Err(SessionError::ShutDown),
        };

        let assembly_c = c_string("assembly", assembly)?;
        let class_c = c_string("class", class)?;
        let function_c = c_string("function", function)?;

        self.host_api
            .create_delegate(host, domain, &assembly_c, &class_c, &function_c)
            .map_err(|code| SessionError::BindFailed {
                target: qualified_name(assembly, class, function),
                code,
            })
    }

    /// Stop the runtime and return its latched exit code.
    ///
    /// The session is `Shutdown` afterwards even if the runtime reports a
    /// failure; that failure is logged, not returned.
    pub fn shutdown(&mut self) -> Result<i32, SessionError> {
        let (host, domain) = match self.state {
            State::Initialized { host, domain } => (host, domain),
            State::Loaded => return Err(SessionError::NotInitialized),
            State::Shutdown => return Err(SessionError::ShutDown),
        };

        let (hr, exit_code) = self.host_api.shutdown(host, domain);
        self.state = State::Shutdown;

        if hr == 0 {
            tracing::info!(domain_id = domain, exit_code, "Runtime shut down");
        } else {
            tracing::warn!(
                domain_id = domain,
                exit_code,
                error = %SessionError::ShutdownFailed(hr),
                "Runtime did not shut down cleanly"
            );
        }
        Ok(exit_code)
    }
}

impl<H: HostApi> Drop for RuntimeSession<H> {
    fn drop(&mut self) {
        if self.is_live() {
            tracing::warn!("Runtime session dropped while live, shutting down");
            let _ = self.shutdown();
        }
    }
}

/// Fully-qualified `assembly:class.function` name used in logs
pub fn qualified_name(assembly: &str, class: &str, function: &str) -> String {
    format!("{}:{}.{}", assembly, class, function)
}

fn c_string(field: &'static str, value: &str) -> Result<CString, SessionError> {
    CString::new(value).map_err(|_| SessionError::InvalidString { field })
}
