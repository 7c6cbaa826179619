//! clr-bridge-api: Shared types for the clr-bridge runtime bridge
//!
//! This crate defines the protocol between the host server and the managed
//! delegates bound to each hook. Request and reply data cross the boundary as
//! MessagePack buffers; the delegate's return value is an [`Outcome`] code.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// ABI version for compatibility checking on the managed side
pub const ABI_VERSION: u32 = 1;

/// Default size of the reply buffer handed to every delegate call
pub const DEFAULT_REPLY_BUFFER_SIZE: usize = 64 * 1024;

/// Calling convention of every bound hook delegate.
///
/// ```text
/// int32 hook(const uint8* request, int32 request_len,
///            uint8* reply, int32 reply_cap, int32* reply_len)
/// ```
///
/// `request` holds a MessagePack [`RequestEnvelope`]. The delegate may write a
/// MessagePack [`HookResponse`] into `reply` and must store the number of
/// bytes written in `reply_len`. Neither buffer outlives the call.
pub type HookFn = unsafe extern "C" fn(*const u8, i32, *mut u8, i32, *mut i32) -> i32;

/// Lifecycle and request-processing events a delegate can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Instantiate,
    Authorize,
    Authenticate,
    Preacct,
    Accounting,
    Checksimul,
    PreProxy,
    PostProxy,
    PostAuth,
    #[cfg(feature = "coa")]
    RecvCoa,
    #[cfg(feature = "coa")]
    SendCoa,
    Detach,
}

impl Hook {
    /// Every hook slot, in table order
    #[cfg(not(feature = "coa"))]
    pub const ALL: [Hook; 10] = [
        Hook::Instantiate,
        Hook::Authorize,
        Hook::Authenticate,
        Hook::Preacct,
        Hook::Accounting,
        Hook::Checksimul,
        Hook::PreProxy,
        Hook::PostProxy,
        Hook::PostAuth,
        Hook::Detach,
    ];

    /// Every hook slot, in table order
    #[cfg(feature = "coa")]
    pub const ALL: [Hook; 12] = [
        Hook::Instantiate,
        Hook::Authorize,
        Hook::Authenticate,
        Hook::Preacct,
        Hook::Accounting,
        Hook::Checksimul,
        Hook::PreProxy,
        Hook::PostProxy,
        Hook::PostAuth,
        Hook::RecvCoa,
        Hook::SendCoa,
        Hook::Detach,
    ];

    /// Number of hook slots
    pub const COUNT: usize = Hook::ALL.len();

    /// Configuration name of the hook (the `<hook>` in `func_<hook>`)
    pub fn name(self) -> &'static str {
        match self {
            Hook::Instantiate => "instantiate",
            Hook::Authorize => "authorize",
            Hook::Authenticate => "authenticate",
            Hook::Preacct => "preacct",
            Hook::Accounting => "accounting",
            Hook::Checksimul => "checksimul",
            Hook::PreProxy => "pre_proxy",
            Hook::PostProxy => "post_proxy",
            Hook::PostAuth => "post_auth",
            #[cfg(feature = "coa")]
            Hook::RecvCoa => "recv_coa",
            #[cfg(feature = "coa")]
            Hook::SendCoa => "send_coa",
            Hook::Detach => "detach",
        }
    }

    /// Position of this hook's slot in a fixed-size table
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the hook belongs to module lifecycle rather than a request
    pub fn is_lifecycle(self) -> bool {
        matches!(self, Hook::Instantiate | Hook::Detach)
    }

    /// Hooks the host server invokes per request
    pub fn request_hooks() -> impl Iterator<Item = Hook> {
        Hook::ALL.into_iter().filter(|h| !h.is_lifecycle())
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown hook name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownHook(pub String);

impl fmt::Display for UnknownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hook: {}", self.0)
    }
}

impl std::error::Error for UnknownHook {}

impl FromStr for Hook {
    type Err = UnknownHook;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .into_iter()
            .find(|h| h.name() == s)
            .ok_or_else(|| UnknownHook(s.to_string()))
    }
}

/// Standard per-request result code expected by the host server
///
/// Numbering follows the server's module return codes, so the value a
/// delegate returns is the code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Immediately reject the request
    Reject,
    /// Module failed, don't reply
    Fail,
    /// The module is OK, continue
    Ok,
    /// The module handled the request, so stop
    Handled,
    /// The module considers the request invalid
    Invalid,
    /// Reject the request (user is locked out)
    Userlock,
    /// User not found
    #[serde(rename = "notfound")]
    NotFound,
    /// Module made no decision for this request
    Noop,
    /// Module updated the request
    Updated,
}

impl Outcome {
    /// Numeric code as seen by the host server and the delegate
    pub fn code(self) -> i32 {
        match self {
            Outcome::Reject => 0,
            Outcome::Fail => 1,
            Outcome::Ok => 2,
            Outcome::Handled => 3,
            Outcome::Invalid => 4,
            Outcome::Userlock => 5,
            Outcome::NotFound => 6,
            Outcome::Noop => 7,
            Outcome::Updated => 8,
        }
    }

    /// Map a delegate return value back to an outcome
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Outcome::Reject,
            1 => Outcome::Fail,
            2 => Outcome::Ok,
            3 => Outcome::Handled,
            4 => Outcome::Invalid,
            5 => Outcome::Userlock,
            6 => Outcome::NotFound,
            7 => Outcome::Noop,
            8 => Outcome::Updated,
            _ => return None,
        })
    }

    /// Request accepted or handled by the module
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Handled | Outcome::Updated)
    }

    /// Module deferred to other processing
    pub fn is_defer(self) -> bool {
        matches!(self, Outcome::Noop | Outcome::NotFound)
    }

    /// Module refused the request or could not process it
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Outcome::Reject | Outcome::Fail | Outcome::Invalid | Outcome::Userlock
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Reject => "reject",
            Outcome::Fail => "fail",
            Outcome::Ok => "ok",
            Outcome::Handled => "handled",
            Outcome::Invalid => "invalid",
            Outcome::Userlock => "userlock",
            Outcome::NotFound => "notfound",
            Outcome::Noop => "noop",
            Outcome::Updated => "updated",
        };
        f.write_str(s)
    }
}

/// Assignment operator carried by an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttrOp {
    /// Replace every attribute of the same name
    #[serde(rename = ":=")]
    Set,
    /// Append unconditionally
    #[serde(rename = "+=")]
    Add,
    /// Append only if no attribute of the same name exists
    #[default]
    #[serde(rename = "=")]
    Equal,
}

impl AttrOp {
    pub fn as_str(self) -> &'static str {
        match self {
            AttrOp::Set => ":=",
            AttrOp::Add => "+=",
            AttrOp::Equal => "=",
        }
    }
}

/// A single name/value attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name (e.g., "User-Name")
    pub name: String,

    /// Operator, only meaningful in a [`HookResponse`]
    #[serde(default)]
    pub op: AttrOp,

    /// Printable value
    pub value: String,
}

impl Attribute {
    /// Create an attribute with the default `=` operator
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: AttrOp::Equal,
            value: value.into(),
        }
    }

    /// Set the operator
    pub fn op(mut self, op: AttrOp) -> Self {
        self.op = op;
        self
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} \"{}\"", self.name, self.op.as_str(), self.value)
    }
}

/// Per-request data handed to a delegate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Request number assigned by the host server
    pub number: u64,

    /// Attributes received in the request
    #[serde(default)]
    pub request: Vec<Attribute>,

    /// Attributes to send in the reply
    #[serde(default)]
    pub reply: Vec<Attribute>,

    /// Server-side control attributes
    #[serde(default)]
    pub control: Vec<Attribute>,
}

impl RequestContext {
    /// Create an empty context for a request number
    pub fn new(number: u64) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    /// Add a request attribute
    pub fn with_request(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.push(Attribute::new(name, value));
        self
    }

    /// Add a control attribute
    pub fn with_control(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.control.push(Attribute::new(name, value));
        self
    }

    /// First request attribute value with the given name
    pub fn request_value(&self, name: &str) -> Option<&str> {
        find_value(&self.request, name)
    }

    /// First reply attribute value with the given name
    pub fn reply_value(&self, name: &str) -> Option<&str> {
        find_value(&self.reply, name)
    }

    /// First control attribute value with the given name
    pub fn control_value(&self, name: &str) -> Option<&str> {
        find_value(&self.control, name)
    }

    /// Merge the updates a delegate returned into this context
    pub fn apply(&mut self, response: HookResponse) {
        apply_updates(&mut self.request, response.request);
        apply_updates(&mut self.reply, response.reply);
        apply_updates(&mut self.control, response.control);
    }
}

fn find_value<'a>(list: &'a [Attribute], name: &str) -> Option<&'a str> {
    list.iter()
        .find(|a| a.name == name)
        .map(|a| a.value.as_str())
}

fn apply_updates(list: &mut Vec<Attribute>, updates: Vec<Attribute>) {
    for attr in updates {
        match attr.op {
            AttrOp::Set => {
                list.retain(|a| a.name != attr.name);
                list.push(attr);
            }
            AttrOp::Add => list.push(attr),
            AttrOp::Equal => {
                if !list.iter().any(|a| a.name == attr.name) {
                    list.push(attr);
                }
            }
        }
    }
}

/// Envelope serialized into the request buffer of every delegate call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope<'a> {
    /// ABI version for compatibility
    pub abi_version: u32,

    /// Hook being invoked
    pub hook: Hook,

    /// Request data
    pub context: Cow<'a, RequestContext>,
}

impl<'a> RequestEnvelope<'a> {
    /// Wrap a borrowed context for the given hook
    pub fn new(hook: Hook, context: &'a RequestContext) -> Self {
        Self {
            abi_version: ABI_VERSION,
            hook,
            context: Cow::Borrowed(context),
        }
    }
}

/// Attribute updates a delegate may write into the reply buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(default)]
    pub request: Vec<Attribute>,

    #[serde(default)]
    pub reply: Vec<Attribute>,

    #[serde(default)]
    pub control: Vec<Attribute>,
}

impl HookResponse {
    /// First attribute that cannot be applied (empty name), if any
    pub fn invalid_attribute(&self) -> Option<&Attribute> {
        self.request
            .iter()
            .chain(&self.reply)
            .chain(&self.control)
            .find(|a| a.name.trim().is_empty())
    }

    /// Whether the response carries no updates
    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.reply.is_empty() && self.control.is_empty()
    }
}
