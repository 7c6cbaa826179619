//! Shared fixtures: an in-process host API and delegates speaking the hook ABI

#![allow(dead_code)]

use clr_bridge_api::{
    AttrOp, Attribute, Hook, HookFn, HookResponse, Outcome, RequestEnvelope, ABI_VERSION,
};
use clr_bridge_host::{Delegate, DomainId, HostApi, HostHandle, ModuleConfig};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

pub const ASSEMBLY: &str = "Radius";
pub const CLASS: &str = "Radius.Hooks";

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
    Shutdown,
}

/// Host API backed by plain Rust functions
pub struct FakeHost {
    init_code: i32,
    exit_code: i32,
    functions: HashMap<String, HookFn>,
    calls: Arc<Mutex<Vec<HostCall>>>,
}

impl FakeHost {
    pub const BIND_FAILURE: i32 = 0x8013_1522_u32 as i32;

    pub fn new() -> Self {
        Self {
            init_code: 0,
            exit_code: 0,
            functions: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn init_code(mut self, code: i32) -> Self {
        self.init_code = code;
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Expose `f` as `Radius:Radius.Hooks.<function>`
    pub fn function(mut self, function: &str, f: HookFn) -> Self {
        self.functions.insert(target(function), f);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<HostCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn target(function: &str) -> String {
    format!("{}:{}.{}", ASSEMBLY, CLASS, function)
}

pub fn delegate_targets(calls: &Arc<Mutex<Vec<HostCall>>>) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            HostCall::CreateDelegate { target } => Some(target.clone()),
            _ => None,
        })
        .collect()
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
        // The handle is never dereferenced, only passed back to this host
        let host = unsafe { HostHandle::from_raw(NonNull::<c_void>::dangling().as_ptr()) };
        Ok((host, 1))
    }

    fn create_delegate(
        &self,
        _host: HostHandle,
        _domain: DomainId,
        assembly: &CStr,
        class: &CStr,
        function: &CStr,
    ) -> Result<Delegate, i32> {
        let target = format!("{}:{}.{}", lossy(assembly), lossy(class), lossy(function));
        self.record(HostCall::CreateDelegate {
            target: target.clone(),
        });
        let f = self.functions.get(&target).ok_or(Self::BIND_FAILURE)?;
        unsafe { Delegate::from_raw(*f as *const () as *mut c_void) }.ok_or(Self::BIND_FAILURE)
    }

    fn shutdown(&self, _host: HostHandle, _domain: DomainId) -> (i32, i32) {
        self.record(HostCall::Shutdown);
        (0, self.exit_code)
    }
}

/// Module config with the shared assembly/class and the given hooks enabled
pub fn config(hooks: &[(&str, &str)]) -> ModuleConfig {
    let mut pairs = vec![
        ("assembly".to_string(), ASSEMBLY.to_string()),
        ("class".to_string(), CLASS.to_string()),
        ("app_base_path".to_string(), "/srv/radius".to_string()),
    ];
    for (hook, function) in hooks {
        pairs.push((format!("func_{hook}"), function.to_string()));
    }
    ModuleConfig::from_section(pairs).expect("valid test config")
}

unsafe fn read_envelope(request: *const u8, len: i32) -> Option<RequestEnvelope<'static>> {
    let bytes = std::slice::from_raw_parts(request, usize::try_from(len).ok()?);
    rmp_serde::from_slice(bytes).ok()
}

unsafe fn write_response(
    response: &HookResponse,
    reply: *mut u8,
    reply_cap: i32,
    reply_len: *mut i32,
) -> bool {
    let Ok(bytes) = rmp_serde::to_vec_named(response) else {
        return false;
    };
    if bytes.len() > reply_cap as usize {
        return false;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), reply, bytes.len());
    *reply_len = bytes.len() as i32;
    true
}

/// Greets the user: sets Reply-Message and accepts, or NotFound without User-Name
pub unsafe extern "C" fn greet_hook(
    request: *const u8,
    request_len: i32,
    reply: *mut u8,
    reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    let Some(envelope) = read_envelope(request, request_len) else {
        return Outcome::Invalid.code();
    };
    if envelope.abi_version != ABI_VERSION {
        return Outcome::Invalid.code();
    }
    let Some(user) = envelope.context.request_value("User-Name") else {
        return Outcome::NotFound.code();
    };

    let response = HookResponse {
        reply: vec![
            Attribute::new("Reply-Message", format!("Hello, {user} ({})", envelope.hook))
                .op(AttrOp::Set),
        ],
        control: vec![Attribute::new("Auth-Type", "Accept").op(AttrOp::Set)],
        ..Default::default()
    };
    if !write_response(&response, reply, reply_cap, reply_len) {
        return Outcome::Fail.code();
    }
    Outcome::Updated.code()
}

/// Always rejects
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

/// Returns OK without touching the reply buffer
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

/// Returns a code outside the outcome range
pub unsafe extern "C" fn bogus_code_hook(
    _request: *const u8,
    _request_len: i32,
    _reply: *mut u8,
    _reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    99
}

/// Claims to have written more than the buffer holds
pub unsafe extern "C" fn overflow_hook(
    _request: *const u8,
    _request_len: i32,
    _reply: *mut u8,
    reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = reply_cap.saturating_add(1);
    Outcome::Ok.code()
}

/// Writes bytes that are not a valid response
pub unsafe extern "C" fn garbage_hook(
    _request: *const u8,
    _request_len: i32,
    reply: *mut u8,
    _reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    // 0xc1 is never used in MessagePack
    *reply = 0xc1;
    *reply_len = 1;
    Outcome::Ok.code()
}

/// Returns an attribute without a name
pub unsafe extern "C" fn nameless_hook(
    _request: *const u8,
    _request_len: i32,
    reply: *mut u8,
    reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    let response = HookResponse {
        reply: vec![Attribute::new("", "orphan")],
        ..Default::default()
    };
    write_response(&response, reply, reply_cap, reply_len);
    Outcome::Ok.code()
}

/// Echoes the hook it was invoked for into the control list
pub unsafe extern "C" fn echo_hook_name(
    request: *const u8,
    request_len: i32,
    reply: *mut u8,
    reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    *reply_len = 0;
    let Some(envelope) = read_envelope(request, request_len) else {
        return Outcome::Invalid.code();
    };
    let hook: Hook = envelope.hook;
    let response = HookResponse {
        control: vec![Attribute::new("Hook-Name", hook.name()).op(AttrOp::Add)],
        ..Default::default()
    };
    write_response(&response, reply, reply_cap, reply_len);
    Outcome::Ok.code()
}
