//! clr-bridge-host: Managed runtime bridge for authentication server modules
//!
//! This crate loads a managed runtime hosting library, starts one execution
//! context per module instance, binds delegates for the configured hooks and
//! dispatches server events into them.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod instance;
pub mod loader;
pub mod session;

#[cfg(test)]
mod testing;

pub use bridge::{RadiusModule, SharedModule};
pub use clr_bridge_api::{AttrOp, Attribute, Hook, HookResponse, Outcome, RequestContext};
pub use config::{ConfigError, ModuleConfig};
pub use dispatch::{DispatchError, Dispatcher};
pub use hooks::{BindReport, FunctionDescriptor, HookTable};
pub use instance::{InstantiateError, ModuleInstance};
pub use loader::{ClrHostApi, ClrLibrary, Delegate, DomainId, HostApi, HostHandle, LoaderError};
pub use session::{RuntimeSession, SessionError, SessionId, SessionStatus, StartupProperties};
