//! Capability whitelist and the table a context is seeded with.
//!
//! The ambient surface a guest can read is built by inclusion:
//!
//! - Host-provided capabilities (`console`, timers, base64, `crypto`) only
//!   exist inside the isolate when the table lists them.
//! - Engine builtins always exist in V8, so the bootstrap turns every global
//!   name (at every level of the global object's prototype chain) that the
//!   table does not list into a throwing accessor.
//!
//! A table is applied exactly once, when its context is created.

use serde::Serialize;

/// Names the language needs to function at all. A caller-supplied whitelist
/// is appended to this set.
pub const MIN_SAFE_OBJECTS: &[&str] = &[
    // value properties
    "undefined",
    "NaN",
    "Infinity",
    // functions
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    // fundamental objects
    "Object",
    "Boolean",
    "Symbol",
    // errors
    "Error",
    "AggregateError",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
    // numbers, dates, text
    "Number",
    "BigInt",
    "Math",
    "Date",
    "String",
    "RegExp",
    // collections
    "Array",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    // structured data
    "ArrayBuffer",
    "DataView",
    "JSON",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
    "BigInt64Array",
    "BigUint64Array",
    "Reflect",
    // Object.prototype members reached through every ordinary object
    "constructor",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
];

/// Added on top of [`MIN_SAFE_OBJECTS`] when no whitelist is configured.
const DEFAULT_EXTRA_OBJECTS: &[&str] = &[
    "Promise",
    "Function",
    "Intl",
    "console",
    "setTimeout",
    "clearTimeout",
    "queueMicrotask",
    "atob",
    "btoa",
    "crypto",
];

/// The set used when a sandbox is created without a whitelist.
pub fn default_safe_objects() -> Vec<String> {
    MIN_SAFE_OBJECTS
        .iter()
        .chain(DEFAULT_EXTRA_OBJECTS)
        .map(|name| name.to_string())
        .collect()
}

/// Ordered, duplicate-free list of names guest code may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist {
    names: Vec<String>,
}

impl Whitelist {
    /// Use exactly `names`, in order, dropping repeats.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self { names: unique }
    }

    /// [`MIN_SAFE_OBJECTS`] followed by `extra`.
    pub fn minimal_with<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            MIN_SAFE_OBJECTS
                .iter()
                .map(|name| name.to_string())
                .chain(extra.into_iter().map(Into::into)),
        )
    }

    /// The whitelist a sandbox uses for an optional caller-supplied list.
    pub fn from_config(configured: Option<&[String]>) -> Self {
        match configured {
            Some(extra) => Self::minimal_with(extra.iter().cloned()),
            None => Self::new(default_safe_objects()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::from_config(None)
    }
}

/// Capabilities implemented by host ops rather than by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostCapability {
    #[serde(rename = "console")]
    Console,
    #[serde(rename = "setTimeout")]
    SetTimeout,
    #[serde(rename = "clearTimeout")]
    ClearTimeout,
    #[serde(rename = "queueMicrotask")]
    QueueMicrotask,
    #[serde(rename = "atob")]
    Atob,
    #[serde(rename = "btoa")]
    Btoa,
    #[serde(rename = "crypto")]
    Crypto,
}

impl HostCapability {
    pub const ALL: [HostCapability; 7] = [
        HostCapability::Console,
        HostCapability::SetTimeout,
        HostCapability::ClearTimeout,
        HostCapability::QueueMicrotask,
        HostCapability::Atob,
        HostCapability::Btoa,
        HostCapability::Crypto,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HostCapability::Console => "console",
            HostCapability::SetTimeout => "setTimeout",
            HostCapability::ClearTimeout => "clearTimeout",
            HostCapability::QueueMicrotask => "queueMicrotask",
            HostCapability::Atob => "atob",
            HostCapability::Btoa => "btoa",
            HostCapability::Crypto => "crypto",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.name() == name)
    }
}

/// Closed description of the ambient surface of one isolation context.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityTable {
    #[serde(skip)]
    generation: u64,
    allowed: Vec<String>,
    host: Vec<HostCapability>,
}

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");
const CAPABILITIES_PLACEHOLDER: &str = "__INITMINAL_CAPABILITIES__";

impl CapabilityTable {
    /// Build the table for `whitelist`. `generation` identifies the whitelist
    /// revision so stale contexts can be detected.
    pub fn build(whitelist: &Whitelist, generation: u64) -> Self {
        let host = whitelist
            .names()
            .iter()
            .filter_map(|name| HostCapability::from_name(name))
            .collect();

        Self {
            generation,
            allowed: whitelist.names().to_vec(),
            host,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.iter().any(|n| n == name)
    }

    pub fn includes_host(&self, capability: HostCapability) -> bool {
        self.host.contains(&capability)
    }

    /// The bootstrap script with this table embedded. Evaluating it yields
    /// the dispatch function.
    pub(crate) fn bootstrap_script(&self) -> Result<String, serde_json::Error> {
        let table = serde_json::to_string(self)?;
        Ok(BOOTSTRAP_JS.replacen(CAPABILITIES_PLACEHOLDER, &table, 1))
    }
}
