//! Module configuration
//!
//! Parses one module section of flat `key = value` pairs:
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `assembly` / `class` | none | Shared defaults for every hook |
//! | `asm_<hook>` | `${.assembly}` | Assembly for that hook |
//! | `class_<hook>` | `${.class}` | Class for that hook |
//! | `func_<hook>` | none | Function for that hook; absent disables it |
//! | `clr_library` | platform library name | Hosting library to load |
//! | `app_base_path` | current directory | Application base path |
//! | `app_name` | `FreeRadius` | Execution context name |
//! | `clr_path` | none | Directory scanned for `*.dll` trusted assemblies |
//! | `trusted_assemblies` | none | Extra trusted assemblies (path list) |
//! | `prop_<NAME>` | none | Extra startup property `NAME` |
//! | `reply_buffer_size` | 65536 | Reply buffer size per delegate call |
//!
//! Values may reference sibling keys with `${.key}`.

use crate::hooks::{FunctionDescriptor, HookTable};
use crate::loader::DEFAULT_CLR_LIBRARY;
use crate::session::{StartupProperties, APP_PATHS, TRUSTED_PLATFORM_ASSEMBLIES};
use clr_bridge_api::{Hook, DEFAULT_REPLY_BUFFER_SIZE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default execution context name
pub const DEFAULT_APP_NAME: &str = "FreeRadius";

const PROPERTY_PREFIX: &str = "prop_";

const GLOBAL_KEYS: &[&str] = &[
    "assembly",
    "class",
    "clr_library",
    "app_base_path",
    "app_name",
    "clr_path",
    "trusted_assemblies",
    "reply_buffer_size",
];

/// Errors that can occur while reading module configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{key}' references unknown key '{reference}'")]
    UnresolvedReference { key: String, reference: String },

    #[error("Reference cycle through '{0}'")]
    ReferenceCycle(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Hook {hook} is enabled but '{key}' is not set")]
    MissingSetting { hook: Hook, key: String },

    #[error("Failed to read assembly directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parsed configuration of one module instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    /// Hosting library path or name
    pub clr_library: PathBuf,

    /// Application base path passed to the runtime
    pub app_base_path: PathBuf,

    /// Execution context name
    pub app_name: String,

    /// Directory scanned for trusted assemblies
    pub clr_path: Option<PathBuf>,

    /// Explicitly trusted assemblies
    pub trusted_assemblies: Vec<PathBuf>,

    /// Extra startup properties from `prop_<NAME>` keys
    pub properties: Vec<(String, String)>,

    /// Reply buffer size per delegate call
    pub reply_buffer_size: usize,

    /// Descriptor for every hook, in [`Hook::ALL`] order
    pub hooks: Vec<(Hook, FunctionDescriptor)>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            clr_library: PathBuf::from(DEFAULT_CLR_LIBRARY),
            app_base_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            app_name: DEFAULT_APP_NAME.to_string(),
            clr_path: None,
            trusted_assemblies: Vec::new(),
            properties: Vec::new(),
            reply_buffer_size: DEFAULT_REPLY_BUFFER_SIZE,
            hooks: Hook::ALL
                .into_iter()
                .map(|h| (h, FunctionDescriptor::default()))
                .collect(),
        }
    }
}

impl ModuleConfig {
    /// Parse a module section of key/value pairs
    pub fn from_section<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let section = Section {
            raw: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        section.warn_unknown_keys();

        let mut config = ModuleConfig::default();

        if let Some(library) = section.get("clr_library")? {
            config.clr_library = PathBuf::from(library);
        }
        if let Some(path) = section.get("app_base_path")? {
            config.app_base_path = PathBuf::from(path);
        }
        if let Some(name) = section.get("app_name")? {
            config.app_name = name;
        }
        config.clr_path = section.get("clr_path")?.map(PathBuf::from);
        if let Some(list) = section.get("trusted_assemblies")? {
            config.trusted_assemblies = std::env::split_paths(&list)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(size) = section.get("reply_buffer_size")? {
            config.reply_buffer_size = parse_buffer_size(&size)?;
        }

        for key in section.raw.keys() {
            if let Some(name) = key.strip_prefix(PROPERTY_PREFIX) {
                if name.is_empty() {
                    return Err(ConfigError::invalid(key, "property name is empty"));
                }
                let value = section.get(key)?.unwrap_or_default();
                config.properties.push((name.to_string(), value));
            }
        }

        config.hooks = Hook::ALL
            .into_iter()
            .map(|hook| Ok((hook, section.descriptor(hook)?)))
            .collect::<Result<_, ConfigError>>()?;

        Ok(config)
    }

    /// Read a JSON object of key/value pairs.
    ///
    /// String values are used as-is, numbers and booleans are stringified and
    /// arrays of strings are joined as a platform path list.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let object: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let pairs = object
            .into_iter()
            .map(|(key, value)| {
                let value = json_value(&key, value)?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        tracing::debug!(path = %path.display(), "Config file loaded");
        Self::from_section(pairs)
    }

    /// Descriptor configured for a hook
    pub fn descriptor(&self, hook: Hook) -> Option<&FunctionDescriptor> {
        self.hooks.iter().find(|(h, _)| *h == hook).map(|(_, d)| d)
    }

    /// Build an unbound hook table from the configured descriptors
    pub fn hook_table(&self) -> HookTable {
        let mut table = HookTable::new();
        for (hook, descriptor) in &self.hooks {
            table.configure(*hook, descriptor.clone());
        }
        table
    }

    /// Every trusted assembly: explicit entries, then `clr_path` contents
    pub fn trusted_platform_assemblies(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let mut assemblies = self.trusted_assemblies.clone();
        if let Some(dir) = &self.clr_path {
            for path in scan_assemblies(dir)? {
                if !assemblies.contains(&path) {
                    assemblies.push(path);
                }
            }
        }
        Ok(assemblies)
    }

    /// Startup properties handed to the runtime at initialization
    pub fn startup_properties(&self) -> Result<StartupProperties, ConfigError> {
        let tpa = std::env::join_paths(self.trusted_platform_assemblies()?)
            .map_err(|e| ConfigError::invalid("trusted_assemblies", e.to_string()))?;

        let mut properties = StartupProperties::new();
        properties.insert(TRUSTED_PLATFORM_ASSEMBLIES, tpa.to_string_lossy());
        properties.insert(APP_PATHS, self.app_base_path.to_string_lossy());
        for (key, value) in &self.properties {
            properties.insert(key.as_str(), value.as_str());
        }
        Ok(properties)
    }
}

/// `*.dll` files in a directory, sorted by path
pub fn scan_assemblies(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ConfigError> {
    let dir = dir.as_ref();
    let read_error = |source| ConfigError::ReadDirectory {
        path: dir.to_path_buf(),
        source,
    };

    let mut assemblies = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();

        // Only process .dll files
        let is_dll = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("dll"))
            .unwrap_or(false);
        if is_dll && path.is_file() {
            assemblies.push(path);
        }
    }
    assemblies.sort();

    tracing::debug!(dir = %dir.display(), count = assemblies.len(), "Scanned trusted assemblies");
    Ok(assemblies)
}

fn parse_buffer_size(value: &str) -> Result<usize, ConfigError> {
    let size: usize = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid("reply_buffer_size", format!("{e}")))?;
    if size == 0 || size > i32::MAX as usize {
        return Err(ConfigError::invalid(
            "reply_buffer_size",
            format!("must be between 1 and {}", i32::MAX),
        ));
    }
    Ok(size)
}

fn json_value(key: &str, value: serde_json::Value) -> Result<String, ConfigError> {
    use serde_json::Value;

    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(items) => {
            let paths = items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(ConfigError::invalid(
                        key,
                        format!("expected a list of strings, found {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            std::env::join_paths(paths)
                .map(|joined| joined.to_string_lossy().into_owned())
                .map_err(|e| ConfigError::invalid(key, e.to_string()))
        }
        other => Err(ConfigError::invalid(
            key,
            format!("unsupported value {other}"),
        )),
    }
}

struct Section {
    raw: BTreeMap<String, String>,
}

impl Section {
    /// Expanded value of a key, if set
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.raw.get(key) {
            Some(value) => {
                let mut stack = vec![key.to_string()];
                self.expand(key, value, &mut stack).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Value of a key, falling back to a shared default key
    fn get_or(&self, key: &str, default_key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key)? {
            Some(value) => Ok(Some(value)),
            None => self.get(default_key),
        }
    }

    fn descriptor(&self, hook: Hook) -> Result<FunctionDescriptor, ConfigError> {
        let asm_key = format!("asm_{}", hook.name());
        let class_key = format!("class_{}", hook.name());
        let func_key = format!("func_{}", hook.name());

        let assembly = self.get_or(&asm_key, "assembly")?;
        let class = self.get_or(&class_key, "class")?;
        let function = self.get(&func_key)?.filter(|f| !f.trim().is_empty());

        let Some(function) = function else {
            return Ok(FunctionDescriptor::disabled(
                assembly.unwrap_or_default(),
                class.unwrap_or_default(),
            ));
        };

        let assembly = assembly
            .filter(|a| !a.is_empty())
            .ok_or(ConfigError::MissingSetting { hook, key: asm_key })?;
        let class = class
            .filter(|c| !c.is_empty())
            .ok_or(ConfigError::MissingSetting { hook, key: class_key })?;

        Ok(FunctionDescriptor::new(assembly, class, function))
    }

    fn expand(
        &self,
        key: &str,
        value: &str,
        stack: &mut Vec<String>,
    ) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find("${.") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end = after
                .find('}')
                .ok_or_else(|| ConfigError::invalid(key, "unterminated ${. reference"))?;
            let reference = &after[..end];

            if stack.iter().any(|k| k == reference) {
                return Err(ConfigError::ReferenceCycle(reference.to_string()));
            }
            let target = self
                .raw
                .get(reference)
                .ok_or_else(|| ConfigError::UnresolvedReference {
                    key: key.to_string(),
                    reference: reference.to_string(),
                })?;

            stack.push(reference.to_string());
            out.push_str(&self.expand(reference, target, stack)?);
            stack.pop();

            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn warn_unknown_keys(&self) {
        for key in self.raw.keys() {
            if !is_known_key(key) {
                tracing::warn!(key = %key, "Ignoring unknown configuration key");
            }
        }
    }
}

fn is_known_key(key: &str) -> bool {
    if GLOBAL_KEYS.contains(&key) || key.starts_with(PROPERTY_PREFIX) {
        return true;
    }
    ["asm_", "class_", "func_"].iter().any(|prefix| {
        key.strip_prefix(prefix)
            .is_some_and(|hook| hook.parse::<Hook>().is_ok())
    })
}
