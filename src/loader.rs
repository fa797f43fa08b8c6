//! Guest module loader. Only `data:` and `blob:` modules can be loaded.
//!
//! The resolver rewrites every dependency the guest declares into one of
//! those two forms before the source reaches a context, so anything else
//! arriving here is an import the host never approved.

use crate::encoding::{decode_data_uri, BlobStore};
use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};

/// A module loader that serves inline sources and registered blobs.
///
/// Security guarantees:
/// - No network access (http/https specifiers rejected)
/// - No filesystem access (file URLs and paths rejected)
/// - Relative imports inside a guest module have nowhere to resolve to
pub struct GuestModuleLoader {
    blobs: BlobStore,
}

impl GuestModuleLoader {
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    fn is_scheme_allowed(specifier: &ModuleSpecifier) -> bool {
        matches!(specifier.scheme(), "data" | "blob")
    }
}

impl ModuleLoader for GuestModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if specifier.starts_with("http://") || specifier.starts_with("https://") {
            return Err(anyhow!(
                "Remote imports must be mapped through dependencies: {}",
                specifier
            ));
        }

        let resolved = ModuleSpecifier::parse(specifier)
            .map_err(|_| anyhow!("Module imports are forbidden: {}", specifier))?;

        if !Self::is_scheme_allowed(&resolved) {
            return Err(anyhow!("Module imports are forbidden: {}", specifier));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();

        let code = match specifier.scheme() {
            "data" => match decode_data_uri(specifier.as_str()) {
                Ok(code) => code,
                Err(e) => return ModuleLoadResponse::Sync(Err(e)),
            },
            "blob" => match self.blobs.get(specifier.as_str()) {
                Some(code) => code.to_string(),
                None => {
                    return ModuleLoadResponse::Sync(Err(anyhow!(
                        "Blob URL has been revoked or never existed: {}",
                        specifier
                    )));
                }
            },
            other => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Module imports are forbidden: {} (scheme '{}')",
                    specifier,
                    other
                )));
            }
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            &specifier,
            None,
        )))
    }
}
