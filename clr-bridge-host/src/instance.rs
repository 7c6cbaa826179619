//! Module instance lifecycle
//!
//! A [`ModuleInstance`] exclusively owns one runtime session and one hook
//! table. It is created when the server instantiates the module and torn
//! down on detach:
//!
//! ```text
//! instantiate: load library → resolve host API → initialize → bind_all → instantiate hook
//! detach:      detach hook → unbind_all → shutdown
//! ```

use crate::config::{ConfigError, ModuleConfig};
use crate::dispatch::Dispatcher;
use crate::hooks::{BindReport, HookTable};
use crate::loader::{ClrHostApi, HostApi, LoaderError};
use crate::session::{RuntimeSession, SessionError, SessionStatus};
use clr_bridge_api::{Hook, Outcome, RequestContext};
use thiserror::Error;

/// Errors that prevent a module instance from accepting traffic
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("instantiate hook returned {0}")]
    HookRejected(Outcome),
}

/// One configured module stanza bound to its own runtime session
///
/// Not safe for concurrent use: the host server must serialize every call to
/// a given instance, or wrap it in a [`SharedModule`](crate::SharedModule).
pub struct ModuleInstance<H: HostApi = ClrHostApi> {
    dispatcher: Dispatcher,
    hooks: HookTable,
    session: RuntimeSession<H>,
    bind_report: BindReport,
    detached: bool,
}

impl ModuleInstance<ClrHostApi> {
    /// Load the configured hosting library and start the module
    pub fn instantiate(config: &ModuleConfig) -> Result<Self, InstantiateError> {
        tracing::info!(library = %config.clr_library.display(), "Loading hosting library");
        let host_api = ClrHostApi::load(&config.clr_library)?;
        Self::with_host(config, host_api)
    }
}

impl<H: HostApi> ModuleInstance<H> {
    /// Start the module on an already resolved host API
    pub fn with_host(config: &ModuleConfig, host_api: H) -> Result<Self, InstantiateError> {
        let properties = config.startup_properties()?;

        let mut session = RuntimeSession::new(host_api);
        session.initialize_with(
            &config.app_base_path.to_string_lossy(),
            &config.app_name,
            &properties,
        )?;

        let mut hooks = config.hook_table();
        let bind_report = hooks.bind_all(&session);
        tracing::info!(
            app_name = %config.app_name,
            bound = bind_report.bound.len(),
            failed = bind_report.failed.len(),
            "Module instantiated"
        );

        let mut instance = Self {
            dispatcher: Dispatcher::new(config.reply_buffer_size),
            hooks,
            session,
            bind_report,
            detached: false,
        };

        let outcome = instance.run_lifecycle_hook(Hook::Instantiate);
        if matches!(outcome, Outcome::Fail | Outcome::Reject | Outcome::Invalid) {
            tracing::error!(outcome = %outcome, "instantiate hook refused to start the module");
            instance.teardown(false);
            return Err(InstantiateError::HookRejected(outcome));
        }

        Ok(instance)
    }

    /// The hook table (read-only)
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// Result of binding the configured hooks
    pub fn bind_report(&self) -> &BindReport {
        &self.bind_report
    }

    /// Lifecycle state of the runtime session
    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Whether [`detach`](Self::detach) has run
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Dispatch a request-processing hook.
    ///
    /// Lifecycle hooks are run by the instance itself and are refused here
    /// with `Invalid`.
    pub fn dispatch(&self, hook: Hook, ctx: &mut RequestContext) -> Outcome {
        if hook.is_lifecycle() {
            tracing::warn!(hook = %hook, "Lifecycle hooks cannot be dispatched per request");
            return Outcome::Invalid;
        }
        self.dispatcher.dispatch(&self.hooks, &self.session, hook, ctx)
    }

    /// Run the detach hook, release every delegate and shut the runtime down.
    ///
    /// Returns the runtime's exit code on the first call, `None` afterwards.
    pub fn detach(&mut self) -> Option<i32> {
        if self.detached {
            return None;
        }
        self.teardown(true)
    }

    fn run_lifecycle_hook(&self, hook: Hook) -> Outcome {
        if !self.hooks.is_bound(hook) {
            return Outcome::Noop;
        }
        let mut ctx = RequestContext::default();
        let outcome = self
            .dispatcher
            .dispatch(&self.hooks, &self.session, hook, &mut ctx);
        tracing::debug!(hook = %hook, outcome = %outcome, "Lifecycle hook returned");
        outcome
    }

    fn teardown(&mut self, run_detach_hook: bool) -> Option<i32> {
        self.detached = true;

        if run_detach_hook {
            self.run_lifecycle_hook(Hook::Detach);
        }
        self.hooks.unbind_all();

        match self.session.shutdown() {
            Ok(exit_code) => Some(exit_code),
            Err(e) => {
                tracing::warn!(error = %e, "Runtime session was not live at detach");
                None
            }
        }
    }
}

impl<H: HostApi> Drop for ModuleInstance<H> {
    fn drop(&mut self) {
        if !self.detached {
            self.detach();
        }
    }
}
