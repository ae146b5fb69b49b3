//! ES module loader over the service's sub-resources.
//!
//! Every module of a service lives under `microsvc:///`, with paths relative
//! to the service's base location. Loading goes through
//! [`EngineHost::load_resource`](microsvc::EngineHost::load_resource), so
//! imports share the cache and path rules of `Host.load`.

use deno_core::error::{AnyError, generic_error};
use deno_core::{
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};

use crate::ops::ServiceContext;

/// Scheme of service modules.
pub(crate) const MODULE_SCHEME: &str = "microsvc";

const MODULE_ROOT: &str = "microsvc:///";

/// Specifier of the main module for a service URI, named after its last
/// path segment.
pub(crate) fn main_specifier(uri: &str) -> Result<ModuleSpecifier, AnyError> {
    let name = uri
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("main.js");
    Ok(ModuleSpecifier::parse(MODULE_ROOT)?.join(name)?)
}

/// Resolves imports against the importing module and loads them from the
/// service's base location.
pub(crate) struct ResourceModuleLoader {
    pub(crate) context: ServiceContext,
}

impl ModuleLoader for ResourceModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, AnyError> {
        // Imports from the runtime itself resolve from the service root
        let base = match ModuleSpecifier::parse(referrer) {
            Ok(url) if url.scheme() == MODULE_SCHEME => url,
            _ => ModuleSpecifier::parse(MODULE_ROOT)?,
        };
        Ok(base.join(specifier)?)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();
        let ctx = self.context.clone();

        ModuleLoadResponse::Async(Box::pin(async move {
            if specifier.scheme() != MODULE_SCHEME {
                return Err(generic_error(format!("Cannot import {}", specifier)));
            }
            let path = specifier.path().trim_start_matches('/').to_string();
            let host = ctx.host.clone();

            // Fetching happens on the host runtime, which owns the HTTP client
            let bytes = ctx
                .host_runtime
                .spawn(async move { host.load_resource(&path).await })
                .await
                .map_err(|e| generic_error(e.to_string()))?
                .map_err(|e| generic_error(format!("Failed to load {}: {}", specifier, e)))?;
            let code = String::from_utf8(bytes)
                .map_err(|_| generic_error(format!("Module {} is not UTF-8", specifier)))?;

            let module_type = match requested_module_type {
                RequestedModuleType::Json => ModuleType::Json,
                _ => ModuleType::JavaScript,
            };
            Ok(ModuleSource::new(
                module_type,
                ModuleSourceCode::String(code.into()),
                &specifier,
                None,
            ))
        }))
    }
}
