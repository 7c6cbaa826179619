//! Bridge between the host server and module instances
//!
//! [`RadiusModule`] is the per-request integration contract: one entry point
//! per server event, each returning a standard [`Outcome`]. [`SharedModule`]
//! lets several server workers share one instance by serializing calls.

use crate::instance::ModuleInstance;
use crate::loader::{ClrHostApi, HostApi};
use clr_bridge_api::{Hook, Outcome, RequestContext};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Request-processing entry points the host server calls
pub trait RadiusModule {
    /// Dispatch any request-processing hook
    fn call(&mut self, hook: Hook, ctx: &mut RequestContext) -> Outcome;

    fn authenticate(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::Authenticate, ctx)
    }

    fn authorize(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::Authorize, ctx)
    }

    fn preacct(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::Preacct, ctx)
    }

    fn accounting(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::Accounting, ctx)
    }

    /// Simultaneous-use check
    fn checksimul(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::Checksimul, ctx)
    }

    fn pre_proxy(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::PreProxy, ctx)
    }

    fn post_proxy(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::PostProxy, ctx)
    }

    fn post_auth(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::PostAuth, ctx)
    }

    #[cfg(feature = "coa")]
    fn recv_coa(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::RecvCoa, ctx)
    }

    #[cfg(feature = "coa")]
    fn send_coa(&mut self, ctx: &mut RequestContext) -> Outcome {
        self.call(Hook::SendCoa, ctx)
    }
}

impl<H: HostApi> RadiusModule for ModuleInstance<H> {
    fn call(&mut self, hook: Hook, ctx: &mut RequestContext) -> Outcome {
        self.dispatch(hook, ctx)
    }
}

/// A module instance shared between workers
///
/// Every call takes the instance lock for its full duration, so delegates
/// never run concurrently within one instance.
pub struct SharedModule<H: HostApi = ClrHostApi> {
    instance: Arc<Mutex<ModuleInstance<H>>>,
}

impl<H: HostApi> SharedModule<H> {
    /// Wrap an instantiated module
    pub fn new(instance: ModuleInstance<H>) -> Self {
        Self {
            instance: Arc::new(Mutex::new(instance)),
        }
    }

    /// Dispatch a hook, waiting for any in-flight call to finish first
    pub async fn dispatch(&self, hook: Hook, ctx: &mut RequestContext) -> Outcome {
        let mut instance = self.instance.lock().await;
        instance.call(hook, ctx)
    }

    /// Detach the shared instance; later dispatches return `Noop`
    pub async fn detach(&self) -> Option<i32> {
        let mut instance = self.instance.lock().await;
        instance.detach()
    }

    /// Whether the shared instance has been detached
    pub async fn is_detached(&self) -> bool {
        self.instance.lock().await.is_detached()
    }
}

impl<H: HostApi> Clone for SharedModule<H> {
    fn clone(&self) -> Self {
        Self {
            instance: Arc::clone(&self.instance),
        }
    }
}
