//! Filesystem module loader for the module graph.
//!
//! Implements deno_graph's Loader trait over `file:` specifiers. Reserved
//! `cloudflare:kv-storage` imports and WebAssembly modules are reported as
//! external so the graph records them without fetching or parsing them.

use crate::rewriter::KV_STORAGE_NAMESPACE;
use deno_graph::source::{LoadError, LoadFuture, LoadOptions, LoadResponse, Loader};
use deno_graph::ModuleSpecifier;
use std::fs;
use std::io;
use std::sync::Arc;

pub(crate) const WASM_EXTENSION: &str = ".wasm";

/// Returns true for specifiers the bundler leaves to the Workers runtime.
pub(crate) fn is_external(specifier: &ModuleSpecifier) -> bool {
    specifier.as_str().starts_with(KV_STORAGE_NAMESPACE) || is_wasm(specifier)
}

pub(crate) fn is_wasm(specifier: &ModuleSpecifier) -> bool {
    specifier.path().ends_with(WASM_EXTENSION)
}

/// Loader serving modules from the local filesystem.
#[derive(Debug, Default)]
pub struct FsGraphLoader;

impl FsGraphLoader {
    fn load_module(&self, specifier: &ModuleSpecifier) -> Result<Option<LoadResponse>, io::Error> {
        if is_external(specifier) {
            return Ok(Some(LoadResponse::External {
                specifier: specifier.clone(),
            }));
        }

        if specifier.scheme() != "file" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("Only local modules can be bundled: {}", specifier),
            ));
        }
        let path = specifier.to_file_path().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid file specifier: {}", specifier),
            )
        })?;

        match fs::read(&path) {
            Ok(content) => Ok(Some(LoadResponse::Module {
                specifier: specifier.clone(),
                maybe_headers: None,
                content: Arc::from(content),
                mtime: None,
            })),
            // Reported by the graph as a missing module.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Loader for FsGraphLoader {
    fn load(&self, specifier: &ModuleSpecifier, _options: LoadOptions) -> LoadFuture {
        let result = self.load_module(specifier);
        log::debug!("Loaded {}", specifier);

        Box::pin(async move { result.map_err(|e| LoadError::Other(Arc::new(e))) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("cloudflare:kv-storage/NS", true)]
    #[case("file:///worker/module.wasm", true)]
    #[case("file:///worker/index.js", false)]
    #[case("https://example.com/lib.js", false)]
    fn test_is_external(#[case] specifier: &str, #[case] expected: bool) {
        let specifier = ModuleSpecifier::parse(specifier).unwrap();
        assert_eq!(is_external(&specifier), expected);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let specifier = ModuleSpecifier::from_file_path(dir.path().join("missing.js")).unwrap();
        let response = FsGraphLoader.load_module(&specifier).unwrap();
        assert!(response.is_none());
    }

    #[test]
    fn test_load_remote_is_error() {
        let specifier = ModuleSpecifier::parse("https://example.com/lib.js").unwrap();
        assert!(FsGraphLoader.load_module(&specifier).is_err());
    }
}
