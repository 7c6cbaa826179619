//! In-process host API used by the unit tests

use crate::loader::{Delegate, DomainId, HostApi, HostHandle};
use crate::session::qualified_name;
use clr_bridge_api::{HookFn, Outcome};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Initialize {
        app_base_path: String,
        app_name: String,
        properties: Vec<(String, String)>,
    },
    CreateDelegate {
        target: String,
    },
    Shutdown {
        domain: DomainId,
    },
}

pub struct FakeHost {
    init_code: i32,
    shutdown_code: i32,
    exit_code: i32,
    functions: HashMap<String, HookFn>,
    calls: Arc<Mutex<Vec<HostCall>>>,
}

impl FakeHost {
    pub const DOMAIN_ID: DomainId = 7;
    /// COR_E_TYPELOAD
    pub const BIND_FAILURE: i32 = 0x8013_1522_u32 as i32;

    pub fn new() -> Self {
        Self {
            init_code: 0,
            shutdown_code: 0,
            exit_code: 0,
            functions: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn init_code(mut self, code: i32) -> Self {
        self.init_code = code;
        self
    }

    pub fn shutdown_code(mut self, code: i32) -> Self {
        self.shutdown_code = code;
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn function(mut self, assembly: &str, class: &str, function: &str, f: HookFn) -> Self {
        self.functions
            .insert(qualified_name(assembly, class, function), f);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<HostCall>>> {
        Arc::clone(&self.calls)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn lossy(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

impl HostApi for FakeHost {
    fn initialize(
        &self,
        app_base_path: &CStr,
        app_name: &CStr,
        keys: &[&CStr],
        values: &[&CStr],
    ) -> Result<(HostHandle, DomainId), i32> {
        self.record(HostCall::Initialize {
            app_base_path: lossy(app_base_path),
            app_name: lossy(app_name),
            properties: keys
                .iter()
                .zip(values)
                .map(|(k, v)| (lossy(k), lossy(v)))
                .collect(),
        });
        if self.init_code != 0 {
            return Err(self.init_code);
        }
        // SAFETY: the handle is never dereferenced, only passed back to this host.
        let host = unsafe { HostHandle::from_raw(NonNull::<c_void>::dangling().as_ptr()) };
        Ok((host, Self::DOMAIN_ID))
    }

    fn create_delegate(
        &self,
        _host: HostHandle,
        _domain: DomainId,
        assembly: &CStr,
        class: &CStr,
        function: &CStr,
    ) -> Result<Delegate, i32> {
        let target = qualified_name(&lossy(assembly), &lossy(class), &lossy(function));
        self.record(HostCall::CreateDelegate {
            target: target.clone(),
        });
        let f = self.functions.get(&target).ok_or(Self::BIND_FAILURE)?;
        unsafe { Delegate::from_raw(*f as *const () as *mut c_void) }.ok_or(Self::BIND_FAILURE)
    }

    fn shutdown(&self, _host: HostHandle, domain: DomainId) -> (i32, i32) {
        self.record(HostCall::Shutdown { domain });
        (self.shutdown_code, self.exit_code)
    }
}

pub unsafe extern "C" fn ok_hook(
    _request: *const u8,
    _request_len: i32,
    _reply: *mut u8,
    _reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    Outcome::Ok.code()
}

pub unsafe extern "C" fn reject_hook(
    _request: *const u8,
    _request_len: i32,
    _reply: *mut u8,
    _reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    Outcome::Reject.code()
}
