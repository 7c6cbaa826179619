//! Hosting library loader using libloading
//!
//! Opens the managed runtime's hosting library and resolves the three host-API
//! entry points into a typed [`HostApi`] capability.
//!
//! ```text
//! coreclr_initialize        → HostApi::initialize
//! coreclr_create_delegate   → HostApi::create_delegate
//! coreclr_shutdown_2        → HostApi::shutdown
//! ```
//!
//! On Unix the library is opened with `RTLD_NOW | RTLD_GLOBAL` so every host
//! symbol is bound up front and visible to the libraries the runtime loads.

use clr_bridge_api::HookFn;
use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use thiserror::Error;

/// Default hosting library name for the current platform
#[cfg(target_os = "macos")]
pub const DEFAULT_CLR_LIBRARY: &str = "libcoreclr.dylib";

/// Default hosting library name for the current platform
#[cfg(target_os = "windows")]
pub const DEFAULT_CLR_LIBRARY: &str = "coreclr.dll";

/// Default hosting library name for the current platform
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const DEFAULT_CLR_LIBRARY: &str = "libcoreclr.so";

const SYM_INITIALIZE: &str = "coreclr_initialize";
const SYM_CREATE_DELEGATE: &str = "coreclr_create_delegate";
const SYM_SHUTDOWN: &str = "coreclr_shutdown_2";

/// HRESULT E_INVALIDARG
const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

type InitializeFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    c_int,
    *const *const c_char,
    *const *const c_char,
    *mut *mut c_void,
    *mut c_uint,
) -> c_int;

type CreateDelegateFn = unsafe extern "C" fn(
    *mut c_void,
    c_uint,
    *const c_char,
    *const c_char,
    *const c_char,
    *mut *mut c_void,
) -> c_int;

type ShutdownFn = unsafe extern "C" fn(*mut c_void, c_uint, *mut c_int) -> c_int;

/// Errors that can occur while loading the hosting library
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Failed to load hosting library {path}: {source}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Hosting library {path} is missing symbols: {}", .symbols.join(", "))]
    SymbolMissing {
        path: PathBuf,
        symbols: Vec<&'static str>,
    },
}

/// Numeric id of the execution context created by `initialize`
pub type DomainId = u32;

/// Opaque runtime host handle returned by `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHandle(*mut c_void);

impl HostHandle {
    /// Wrap a raw handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be a host handle returned by the runtime's `initialize` (or
    /// a value a custom [`HostApi`] accepts back) and must not be used after
    /// that runtime shuts down.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    /// Raw handle for passing back to the host API
    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

// SAFETY: the handle is only ever used by the instance that owns the session,
// and instances are never shared between threads without a lock.
unsafe impl Send for HostHandle {}

/// Callable reference to a managed function, valid while its session is live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delegate(NonNull<c_void>);

impl Delegate {
    /// Wrap a raw delegate pointer, returning `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a function with the [`HookFn`] calling convention
    /// that stays callable until the owning session shuts down.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Typed view of the delegate.
    ///
    /// # Safety
    ///
    /// The owning session must still be live.
    pub(crate) unsafe fn as_hook_fn(self) -> HookFn {
        std::mem::transmute::<*mut c_void, HookFn>(self.0.as_ptr())
    }
}

// SAFETY: see `HostHandle`.
unsafe impl Send for Delegate {}

/// The host-API capability a runtime session drives
///
/// Error values are the raw status codes returned by the runtime.
pub trait HostApi: Send {
    /// Start the runtime and create its execution context
    fn initialize(
        &self,
        app_base_path: &CStr,
        app_name: &CStr,
        keys: &[&CStr],
        values: &[&CStr],
    ) -> Result<(HostHandle, DomainId), i32>;

    /// Resolve one managed function into a callable delegate
    fn create_delegate(
        &self,
        host: HostHandle,
        domain: DomainId,
        assembly: &CStr,
        class: &CStr,
        function: &CStr,
    ) -> Result<Delegate, i32>;

    /// Stop the runtime, returning `(status, latched_exit_code)`
    fn shutdown(&self, host: HostHandle, domain: DomainId) -> (i32, i32);
}

/// An opened hosting library
pub struct ClrLibrary {
    path: PathBuf,
    #[cfg(unix)]
    inner: libloading::os::unix::Library,
    #[cfg(not(unix))]
    inner: libloading::Library,
}

impl ClrLibrary {
    /// Open the library at `path` with immediate, global symbol binding
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref();

        #[cfg(unix)]
        let inner = unsafe {
            let flags = libloading::os::unix::RTLD_NOW | libloading::os::unix::RTLD_GLOBAL;
            libloading::os::unix::Library::open(Some(path), flags)
        };
        #[cfg(not(unix))]
        let inner = unsafe { libloading::Library::new(path) };

        let inner = inner.map_err(|source| LoaderError::LoadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "Hosting library opened");
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a function symbol.
    ///
    /// # Safety
    ///
    /// `T` must match the symbol's real signature.
    unsafe fn symbol<T: Copy>(&self, name: &str) -> Result<T, libloading::Error> {
        let symbol = self.inner.get::<T>(name.as_bytes())?;
        Ok(*symbol)
    }
}

impl fmt::Debug for ClrLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrLibrary").field("path", &self.path).finish()
    }
}

/// Host API backed by the CoreCLR hosting library
pub struct ClrHostApi {
    initialize: InitializeFn,
    create_delegate: CreateDelegateFn,
    shutdown: ShutdownFn,
    // Must stay last: keeps the function pointers above valid
    library: ClrLibrary,
}

impl ClrHostApi {
    /// Open the hosting library and resolve the host API
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        Self::resolve(ClrLibrary::open(path)?)
    }

    /// Resolve the host API from an opened library.
    ///
    /// Every missing symbol is logged; resolution fails if any is absent.
    pub fn resolve(library: ClrLibrary) -> Result<Self, LoaderError> {
        let mut missing = Vec::new();

        let initialize = lookup::<InitializeFn>(&library, SYM_INITIALIZE, &mut missing);
        let create_delegate =
            lookup::<CreateDelegateFn>(&library, SYM_CREATE_DELEGATE, &mut missing);
        let shutdown = lookup::<ShutdownFn>(&library, SYM_SHUTDOWN, &mut missing);

        match (initialize, create_delegate, shutdown) {
            (Some(initialize), Some(create_delegate), Some(shutdown)) => Ok(Self {
                initialize,
                create_delegate,
                shutdown,
                library,
            }),
            _ => Err(LoaderError::SymbolMissing {
                path: library.path.clone(),
                symbols: missing,
            }),
        }
    }

    /// Path of the underlying hosting library
    pub fn library_path(&self) -> &Path {
        self.library.path()
    }
}

fn lookup<T: Copy>(
    library: &ClrLibrary,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<T> {
    // SAFETY: the caller pairs each symbol name with its CoreCLR signature.
    match unsafe { library.symbol::<T>(name) } {
        Ok(function) => Some(function),
        Err(e) => {
            tracing::error!(
                symbol = name,
                path = %library.path.display(),
                error = %e,
                "Host API symbol missing"
            );
            missing.push(name);
            None
        }
    }
}

/// Parallel key/value pointer arrays for `coreclr_initialize`.
///
/// The runtime reads `count` entries from both arrays, so a length mismatch
/// is rejected here with `E_INVALIDARG`.
fn property_arrays(
    keys: &[&CStr],
    values: &[&CStr],
) -> Result<(c_int, Vec<*const c_char>, Vec<*const c_char>), i32> {
    if keys.len() != values.len() {
        return Err(E_INVALIDARG);
    }
    let count = c_int::try_from(keys.len()).map_err(|_| E_INVALIDARG)?;
    let keys = keys.iter().map(|k| k.as_ptr()).collect();
    let values = values.iter().map(|v| v.as_ptr()).collect();
    Ok((count, keys, values))
}

impl HostApi for ClrHostApi {
    fn initialize(
        &self,
        app_base_path: &CStr,
        app_name: &CStr,
        keys: &[&CStr],
        values: &[&CStr],
    ) -> Result<(HostHandle, DomainId), i32> {
        let (count, keys, values) = property_arrays(keys, values)?;

        let mut host: *mut c_void = ptr::null_mut();
        let mut domain: c_uint = 0;
        // SAFETY: every string outlives the call and both arrays hold `count` entries.
        let hr = unsafe {
            (self.initialize)(
                app_base_path.as_ptr(),
                app_name.as_ptr(),
                count,
                keys.as_ptr(),
                values.as_ptr(),
                &mut host,
                &mut domain,
            )
        };

        if hr == 0 {
            // SAFETY: `host` was just produced by this runtime's initialize.
            Ok((unsafe { HostHandle::from_raw(host) }, domain))
        } else {
            Err(hr)
        }
    }

    fn create_delegate(
        &self,
        host: HostHandle,
        domain: DomainId,
        assembly: &CStr,
        class: &CStr,
        function: &CStr,
    ) -> Result<Delegate, i32> {
        let mut delegate: *mut c_void = ptr::null_mut();
        // SAFETY: host and domain come from a successful initialize on this library.
        let hr = unsafe {
            (self.create_delegate)(
                host.as_raw(),
                domain,
                assembly.as_ptr(),
                class.as_ptr(),
                function.as_ptr(),
                &mut delegate,
            )
        };

        if hr != 0 {
            return Err(hr);
        }
        // SAFETY: managed delegates bound by this bridge use the HookFn convention.
        unsafe { Delegate::from_raw(delegate) }.ok_or(E_INVALIDARG)
    }

    fn shutdown(&self, host: HostHandle, domain: DomainId) -> (i32, i32) {
        let mut exit_code: c_int = 0;
        // SAFETY: host and domain come from a successful initialize on this library.
        let hr = unsafe { (self.shutdown)(host.as_raw(), domain, &mut exit_code) };
        (hr, exit_code)
    }
}

impl fmt::Debug for ClrHostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrHostApi")
            .field("library", &self.library)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libmissing.so");

        match ClrHostApi::load(&path) {
            Err(LoaderError::LoadFailed { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected LoadFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_open_non_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libcoreclr.so");
        std::fs::write(&path, b"not a shared object").unwrap();

        assert!(matches!(
            ClrLibrary::open(&path),
            Err(LoaderError::LoadFailed { .. })
        ));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_library_without_host_symbols() {
        let library = ClrLibrary::open("libc.so.6").unwrap();

        match ClrHostApi::resolve(library) {
            Err(LoaderError::SymbolMissing { symbols, .. }) => {
                assert_eq!(
                    symbols,
                    vec![SYM_INITIALIZE, SYM_CREATE_DELEGATE, SYM_SHUTDOWN]
                );
            }
            other => panic!("Expected SymbolMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_null_delegate_rejected() {
        assert!(unsafe { Delegate::from_raw(ptr::null_mut()) }.is_none());
    }

    #[test]
    fn test_symbol_missing_message() {
        let err = LoaderError::SymbolMissing {
            path: PathBuf::from("libcoreclr.so"),
            symbols: vec![SYM_INITIALIZE, SYM_SHUTDOWN],
        };
        assert_eq!(
            err.to_string(),
            "Hosting library libcoreclr.so is missing symbols: \
             coreclr_initialize, coreclr_shutdown_2"
        );
    }

    #[test]
    fn test_property_arrays_reject_mismatch() {
        let k1 = CStr::from_bytes_with_nul(b"TRUSTED_PLATFORM_ASSEMBLIES\0").unwrap();
        let k2 = CStr::from_bytes_with_nul(b"APP_PATHS\0").unwrap();
        let v1 = CStr::from_bytes_with_nul(b"/opt/a.dll\0").unwrap();

        assert_eq!(property_arrays(&[k1, k2], &[v1]), Err(E_INVALIDARG));
        assert_eq!(property_arrays(&[k1], &[v1, v1]), Err(E_INVALIDARG));

        let (count, keys, values) = property_arrays(&[k1, k2], &[v1, v1]).unwrap();
        assert_eq!(count, 2);
        assert_eq!(keys, vec![k1.as_ptr(), k2.as_ptr()]);
        assert_eq!(values, vec![v1.as_ptr(), v1.as_ptr()]);
        assert_eq!(property_arrays(&[], &[]).map(|(n, _, _)| n), Ok(0));
    }
}
