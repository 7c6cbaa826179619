//! Hook table
//!
//! A fixed table with one slot per [`Hook`]. Each slot holds the configured
//! [`FunctionDescriptor`] and, once bound, the delegate together with the id
//! of the runtime session that resolved it. A delegate is only handed out to
//! dispatches on that same session. Binding is partial-failure tolerant: a slot that cannot be
//! bound is logged and left disabled while the rest are bound normally.

use crate::loader::{Delegate, HostApi};
use crate::session::{qualified_name, RuntimeSession, SessionError, SessionId};
use clr_bridge_api::Hook;
use std::fmt;

/// Names a managed function by assembly, class and function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// Assembly name (e.g., "Radius.Hooks")
    pub assembly_name: String,

    /// Fully-qualified class name within the assembly
    pub class_name: String,

    /// Function name; `None` disables the hook
    pub function_name: Option<String>,
}

impl FunctionDescriptor {
    /// Create a descriptor for an enabled hook
    pub fn new(
        assembly: impl Into<String>,
        class: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            assembly_name: assembly.into(),
            class_name: class.into(),
            function_name: Some(function.into()),
        }
    }

    /// Create a descriptor with no function (hook disabled)
    pub fn disabled(assembly: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            assembly_name: assembly.into(),
            class_name: class.into(),
            function_name: None,
        }
    }

    /// Whether a function is configured
    pub fn is_configured(&self) -> bool {
        self.function_name.is_some()
    }

    /// `assembly:class.function`, if configured
    pub fn target(&self) -> Option<String> {
        self.function_name
            .as_deref()
            .map(|f| qualified_name(&self.assembly_name, &self.class_name, f))
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => f.write_str(&target),
            None => f.write_str("(disabled)"),
        }
    }
}

#[derive(Default)]
struct Slot {
    descriptor: FunctionDescriptor,
    delegate: Option<(Delegate, SessionId)>,
}

/// Outcome of [`HookTable::bind_all`]
#[derive(Debug, Default)]
pub struct BindReport {
    /// Hooks bound successfully
    pub bound: Vec<Hook>,

    /// Hooks that failed to bind (with errors)
    pub failed: Vec<(Hook, SessionError)>,
}

impl BindReport {
    /// Returns true if every configured hook was bound
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of hooks a bind was attempted for
    pub fn attempted(&self) -> usize {
        self.bound.len() + self.failed.len()
    }
}

/// One slot per hook, indexed by [`Hook::index`]
pub struct HookTable {
    slots: [Slot; Hook::COUNT],
}

impl HookTable {
    /// Create a table with every hook disabled
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
        }
    }

    /// Set the descriptor for one hook, discarding any bound delegate
    pub fn configure(&mut self, hook: Hook, descriptor: FunctionDescriptor) {
        self.slots[hook.index()] = Slot {
            descriptor,
            delegate: None,
        };
    }

    /// Configured descriptor for a hook
    pub fn descriptor(&self, hook: Hook) -> &FunctionDescriptor {
        &self.slots[hook.index()].descriptor
    }

    /// Whether the hook has a resolved delegate
    pub fn is_bound(&self, hook: Hook) -> bool {
        self.slots[hook.index()].delegate.is_some()
    }

    /// Delegate for `hook`, if it was resolved by `session`
    pub(crate) fn delegate(&self, hook: Hook, session: SessionId) -> Option<Delegate> {
        match self.slots[hook.index()].delegate {
            Some((delegate, owner)) if owner == session => Some(delegate),
            _ => None,
        }
    }

    /// Hooks with a configured function, in table order
    pub fn configured(&self) -> impl Iterator<Item = (Hook, &FunctionDescriptor)> {
        Hook::ALL
            .into_iter()
            .map(move |hook| (hook, self.descriptor(hook)))
            .filter(|(_, d)| d.is_configured())
    }

    /// Number of bound hooks
    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| s.delegate.is_some()).count()
    }

    /// Resolve every configured hook against a live session.
    ///
    /// Slots already bound by `session` are kept. Delegates left over from
    /// any other session are dropped and re-resolved.
    pub fn bind_all<H: HostApi>(&mut self, session: &RuntimeSession<H>) -> BindReport {
        let mut report = BindReport::default();

        for hook in Hook::ALL {
            let slot = &mut self.slots[hook.index()];
            let Some(function) = slot.descriptor.function_name.as_deref() else {
                continue;
            };
            match slot.delegate {
                Some((_, owner)) if owner == session.id() => {
                    tracing::debug!(hook = %hook, "Hook already bound");
                    continue;
                }
                Some(_) => {
                    tracing::debug!(hook = %hook, "Dropping delegate from a previous session");
                    slot.delegate = None;
                }
                None => {}
            }

            let descriptor = &slot.descriptor;
            tracing::debug!(
                hook = %hook,
                target = %descriptor,
                "Binding hook"
            );

            let bound = session.create_delegate(
                &descriptor.assembly_name,
                &descriptor.class_name,
                function,
            );
            match bound {
                Ok(delegate) => {
                    slot.delegate = Some((delegate, session.id()));
                    tracing::info!(hook = %hook, target = %slot.descriptor, "Hook bound");
                    report.bound.push(hook);
                }
                Err(e) => {
                    tracing::error!(hook = %hook, error = %e, "Failed to bind hook");
                    report.failed.push((hook, e));
                }
            }
        }

        report
    }

    /// Drop every resolved delegate; run before the session shuts down
    pub fn unbind_all(&mut self) {
        for slot in &mut self.slots {
            slot.delegate = None;
        }
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for hook in Hook::ALL {
            let slot = &self.slots[hook.index()];
            map.entry(
                &hook.name(),
                &format_args!(
                    "{}{}",
                    slot.descriptor,
                    if slot.delegate.is_some() { " [bound]" } else { "" }
                ),
            );
        }
        map.finish()
    }
}
