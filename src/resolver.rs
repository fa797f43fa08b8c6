//! Import specifier rewriting.
//!
//! Guest source is scanned textually for `import <bindings> from '<name>'`
//! statements. Every bare or scoped package name must be mapped by the
//! caller; the mapped value is either a loadable URL (kept as is) or inline
//! module source (encoded). Afterwards every `http(s)` import is fetched and
//! re-encoded so the context never touches the network.
//!
//! Matching is an approximation of ES module syntax. It only looks at
//! statements starting a line (after whitespace or `;`), and it will happily
//! match import-shaped text inside strings or comments.

use crate::encoding::EncodingSession;
use crate::error::EvalError;
use crate::fetch::ModuleFetcher;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use url::Url;

/// Caller-supplied mapping from package name to location or inline source.
pub type Dependencies = BTreeMap<String, String>;

static MODULE_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(^[\s|;]*\bimport\b[^;'":@]+?\bfrom\s)["'|\\]((?:@[a-z0-9\-~][a-z0-9\-._~]*/)?[a-z0-9\-~][a-z0-9\-._~]*)["'|\\]"#,
    )
    .expect("module import pattern is valid")
});

static HTTP_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?ms)(^[\s|;]*\bimport\b[^;'":@]+?\bfrom\s)["'|\\](https?://.*?)["'|\\]"#)
        .expect("http import pattern is valid")
});

/// Where a rewritten specifier's location came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// The mapping already held a loadable URL.
    PassedThrough,
    /// The mapping held inline source, which was encoded.
    EncodedSource,
    /// A network address, fetched and encoded.
    Fetched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// The specifier as written in the guest source.
    pub specifier: String,
    pub location: String,
    pub origin: ModuleOrigin,
}

/// Rewritten guest source plus what each specifier became.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub source: String,
    pub modules: Vec<ResolvedModule>,
}

/// Package names imported by `source`, in order of appearance.
pub fn find_module_names(source: &str) -> Vec<String> {
    MODULE_IMPORT_RE
        .captures_iter(source)
        .map(|caps| caps[2].to_string())
        .collect()
}

/// `http(s)` addresses imported by `source`, in order of appearance.
pub fn find_http_imports(source: &str) -> Vec<String> {
    HTTP_IMPORT_RE
        .captures_iter(source)
        .map(|caps| caps[2].to_string())
        .collect()
}

/// Fail with the first imported name that has no mapping.
pub fn check_dependencies(source: &str, dependencies: &Dependencies) -> Result<(), EvalError> {
    match find_module_names(source)
        .into_iter()
        .find(|name| !dependencies.contains_key(name))
    {
        Some(missing) => Err(EvalError::dependencies(format!("No URL found for {}", missing))),
        None => Ok(()),
    }
}

/// True when `value` can be handed to the loader (after network
/// normalization) instead of being treated as inline source.
pub fn is_loadable_location(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https" | "data" | "blob"))
        .unwrap_or(false)
}

/// Check, map and normalize every import in `source`.
///
/// The dependency check runs before anything else; a missing mapping
/// fails the job without fetching or encoding anything.
pub(crate) async fn resolve(
    source: &str,
    dependencies: &Dependencies,
    session: &mut EncodingSession,
    fetcher: &dyn ModuleFetcher,
) -> Result<Resolution, EvalError> {
    check_dependencies(source, dependencies)?;

    let mut modules: Vec<ResolvedModule> = Vec::new();
    let mut locations: HashMap<String, String> = HashMap::new();

    for name in find_module_names(source) {
        if locations.contains_key(&name) {
            continue;
        }
        let Some(value) = dependencies.get(&name) else {
            return Err(EvalError::dependencies(format!("No URL found for {}", name)));
        };
        let (location, origin) = if is_loadable_location(value) {
            (value.clone(), ModuleOrigin::PassedThrough)
        } else {
            (session.encode(value), ModuleOrigin::EncodedSource)
        };
        locations.insert(name.clone(), location.clone());
        modules.push(ResolvedModule {
            specifier: name,
            location,
            origin,
        });
    }

    let mapped = MODULE_IMPORT_RE.replace_all(source, |caps: &Captures| {
        let location = locations.get(&caps[2]).map(String::as_str).unwrap_or(&caps[2]);
        format!("{}\"{}\"", &caps[1], location)
    });

    let mut fetched: HashMap<String, String> = HashMap::new();
    for address in find_http_imports(&mapped) {
        if fetched.contains_key(&address) {
            continue;
        }
        let url = Url::parse(&address)
            .map_err(|e| EvalError::dependencies(format!("Invalid URL {}: {}", address, e)))?;
        tracing::debug!(url = %url, "fetching dependency");
        let text = fetcher
            .fetch_text(&url)
            .await
            .map_err(|e| EvalError::dependencies(format!("{:#}", e)))?;
        let location = session.encode(&text);

        let mut aliased = false;
        for module in modules.iter_mut().filter(|m| m.location == address) {
            module.location = location.clone();
            module.origin = ModuleOrigin::Fetched;
            aliased = true;
        }
        if !aliased {
            modules.push(ResolvedModule {
                specifier: address.clone(),
                location: location.clone(),
                origin: ModuleOrigin::Fetched,
            });
        }
        fetched.insert(address, location);
    }

    let source = HTTP_IMPORT_RE
        .replace_all(&mapped, |caps: &Captures| {
            let location = fetched.get(&caps[2]).map(String::as_str).unwrap_or(&caps[2]);
            format!("{}\"{}\"", &caps[1], location)
        })
        .into_owned();

    Ok(Resolution { source, modules })
}
