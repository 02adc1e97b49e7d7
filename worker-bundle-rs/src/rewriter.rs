//! Import rewriter for the `cloudflare:kv-storage` virtual namespace.
//!
//! Imports such as
//!
//! ```js
//! import cache from "cloudflare:kv-storage/CACHE";
//! ```
//!
//! do not name a real module. While the bundler loads each module, the rewriter
//! removes these declarations from the module tree and reports the local binding
//! (`cache`) and the storage namespace (`CACHE`) through a [`BindingSink`].

use std::sync::Mutex;

use deno_ast::swc::ast::{EsVersion, ImportDecl, ImportSpecifier, Module, ModuleDecl, ModuleItem};
use deno_ast::swc::common::sync::Lrc;
use deno_ast::swc::common::{FileName, SourceFile, SourceMap};
use deno_ast::swc::parser::lexer::Lexer;
use deno_ast::swc::parser::{EsSyntax, Parser, StringInput, Syntax};
use serde::Serialize;
use thiserror::Error;

/// Module path prefix of the reserved virtual namespace.
pub const KV_STORAGE_NAMESPACE: &str = "cloudflare:kv-storage";

/// Per-file failures of the rewriter. All of them are fatal to the file.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Failed to parse {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Import from \"{specifier}\" must bind a local name")]
    MissingBinding { specifier: String },

    #[error("Import from \"{specifier}\" does not name a storage namespace")]
    MissingNamespace { specifier: String },
}

/// A binding registration reported for one removed import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvBinding {
    /// Local identifier the module used for the import.
    pub binding: String,
    /// Storage namespace named by the module path.
    pub namespace: String,
}

/// Receives binding registrations.
///
/// Rewrites of distinct files may run concurrently and share one sink, so
/// implementations must synchronize any aggregation themselves.
pub trait BindingSink: Send + Sync {
    fn on_kv_storage_binding(&self, local_name: &str, namespace: &str);
}

impl<F> BindingSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn on_kv_storage_binding(&self, local_name: &str, namespace: &str) {
        self(local_name, namespace)
    }
}

/// Sink that aggregates every reported binding, in arrival order.
#[derive(Debug, Default)]
pub struct BindingCollector {
    bindings: Mutex<Vec<KvBinding>>,
}

impl BindingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> Vec<KvBinding> {
        match self.bindings.lock() {
            Ok(bindings) => bindings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl BindingSink for BindingCollector {
    fn on_kv_storage_binding(&self, local_name: &str, namespace: &str) {
        let binding = KvBinding {
            binding: local_name.to_string(),
            namespace: namespace.to_string(),
        };
        match self.bindings.lock() {
            Ok(mut bindings) => bindings.push(binding),
            Err(poisoned) => poisoned.into_inner().push(binding),
        }
    }
}

/// Removes reserved-namespace imports from a module tree.
pub struct ImportRewriter<'a> {
    sink: &'a dyn BindingSink,
}

impl<'a> ImportRewriter<'a> {
    pub fn new(sink: &'a dyn BindingSink) -> Self {
        Self { sink }
    }

    /// Visits the top-level import declarations of `module` in document order.
    ///
    /// Every import whose source starts with [`KV_STORAGE_NAMESPACE`] is reported
    /// to the sink and removed. Everything else is left in place. Returns the
    /// removed bindings in the order they were reported.
    ///
    /// On error the module is left untouched and nothing is reported.
    pub fn rewrite_module(&self, module: &mut Module) -> Result<Vec<KvBinding>, RewriteError> {
        let mut removed = Vec::new();
        for item in &module.body {
            if let ModuleItem::ModuleDecl(ModuleDecl::Import(import)) = item {
                if let Some(binding) = reserved_binding(import)? {
                    removed.push(binding);
                }
            }
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        module.body.retain(|item| match item {
            ModuleItem::ModuleDecl(ModuleDecl::Import(import)) => !is_reserved(import),
            _ => true,
        });
        for binding in &removed {
            self.sink
                .on_kv_storage_binding(&binding.binding, &binding.namespace);
        }
        Ok(removed)
    }
}

/// Returns the binding for a reserved import, or `None` for any other import.
fn reserved_binding(import: &ImportDecl) -> Result<Option<KvBinding>, RewriteError> {
    if !is_reserved(import) {
        return Ok(None);
    }
    let specifier = import_source(import);

    // Only the first specifier is considered.
    let local = match import.specifiers.first() {
        Some(ImportSpecifier::Default(s)) => &s.local,
        Some(ImportSpecifier::Named(s)) => &s.local,
        Some(ImportSpecifier::Namespace(s)) => &s.local,
        None => return Err(RewriteError::MissingBinding { specifier }),
    };

    let namespace = match specifier.split('/').nth(1) {
        Some(namespace) if !namespace.is_empty() => namespace.to_string(),
        _ => return Err(RewriteError::MissingNamespace { specifier }),
    };

    Ok(Some(KvBinding {
        binding: local.sym.to_string(),
        namespace,
    }))
}

fn is_reserved(import: &ImportDecl) -> bool {
    import_source(import).starts_with(KV_STORAGE_NAMESPACE)
}

/// Module path of an import, with escape sequences decoded.
fn import_source(import: &ImportDecl) -> String {
    import.src.value.to_atom_lossy().to_string()
}

/// Parses a registered source file as an ES module.
///
/// Returns the module together with the messages of any recoverable syntax
/// errors the parser skipped over.
pub fn parse_module(source_file: &SourceFile) -> Result<(Module, Vec<String>), RewriteError> {
    let input = StringInput::from(source_file);
    let lexer = Lexer::new(
        Syntax::Es(EsSyntax::default()),
        EsVersion::Es2020,
        input,
        None,
    );
    let mut parser = Parser::new_from(lexer);

    let module = parser.parse_module().map_err(|e| RewriteError::Parse {
        file: source_file.name.to_string(),
        message: format!("{:?}", e.kind()),
    })?;
    let recovered = parser
        .take_errors()
        .into_iter()
        .map(|e| format!("{}: {:?}", source_file.name, e.kind()))
        .collect();

    Ok((module, recovered))
}

/// Parses `text` in a fresh source map under the given display name.
pub fn parse_source(name: &str, text: &str) -> Result<Module, RewriteError> {
    let source_map: Lrc<SourceMap> = Default::default();
    let source_file = source_map.new_source_file(
        FileName::Custom(name.to_string()).into(),
        text.to_string(),
    );
    parse_module(&source_file).map(|(module, _)| module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn import_sources(module: &Module) -> Vec<String> {
        module
            .body
            .iter()
            .filter_map(|item| match item {
                ModuleItem::ModuleDecl(ModuleDecl::Import(import)) => Some(import_source(import)),
                _ => None,
            })
            .collect()
    }

    fn rewrite(text: &str) -> (Module, Vec<KvBinding>, Vec<KvBinding>) {
        let mut module = parse_source("test.js", text).unwrap();
        let collector = BindingCollector::new();
        let removed = ImportRewriter::new(&collector)
            .rewrite_module(&mut module)
            .unwrap();
        (module, removed, collector.bindings())
    }

    #[test]
    fn test_no_reserved_imports_leaves_tree_unchanged() {
        let text = r#"
import { h } from "./h.js";
import * as util from "./util.js";
export default { fetch() { return h(util); } };
"#;
        let before = parse_source("test.js", text).unwrap();
        let (after, removed, reported) = rewrite(text);

        assert!(removed.is_empty());
        assert!(reported.is_empty());
        assert_eq!(after.body.len(), before.body.len());
        assert_eq!(import_sources(&after), vec!["./h.js", "./util.js"]);
    }

    #[test]
    fn test_single_reserved_import_is_removed_and_reported() {
        let (module, removed, reported) = rewrite(
            r#"import X from "cloudflare:kv-storage/NS";
addEventListener("fetch", () => X.get("key"));
"#,
        );

        let expected = vec![KvBinding {
            binding: "X".to_string(),
            namespace: "NS".to_string(),
        }];
        assert_eq!(removed, expected);
        assert_eq!(reported, expected);
        assert!(import_sources(&module).is_empty());
        assert_eq!(module.body.len(), 1);
    }

    #[test]
    fn test_multiple_reserved_imports_in_source_order() {
        let (module, _, reported) = rewrite(
            r#"import first from "cloudflare:kv-storage/FIRST";
import { render } from "./render.js";
import second from 'cloudflare:kv-storage/SECOND';
import "./polyfill.js";
import third from "cloudflare:kv-storage/THIRD";
"#,
        );

        let names: Vec<_> = reported
            .iter()
            .map(|b| (b.binding.as_str(), b.namespace.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![("first", "FIRST"), ("second", "SECOND"), ("third", "THIRD")]
        );
        assert_eq!(import_sources(&module), vec!["./render.js", "./polyfill.js"]);
    }

    #[rstest]
    #[case(r#"import { store } from "cloudflare:kv-storage/NS";"#, "store", "NS")]
    #[case(r#"import * as store from "cloudflare:kv-storage/NS";"#, "store", "NS")]
    #[case(r#"import a, { b } from "cloudflare:kv-storage/NS";"#, "a", "NS")]
    #[case(r#"import a from "cloudflare:kv-storage/NS/nested";"#, "a", "NS")]
    #[case(r#"import kv from "cloudflare:kv-storage/\u004eS";"#, "kv", "NS")]
    #[case(r#"import kv from "cloudflare:kv\x2dstorage/NS";"#, "kv", "NS")]
    fn test_first_specifier_and_namespace_segment(
        #[case] text: &str,
        #[case] binding: &str,
        #[case] namespace: &str,
    ) {
        let (_, removed, _) = rewrite(text);
        assert_eq!(
            removed,
            vec![KvBinding {
                binding: binding.to_string(),
                namespace: namespace.to_string(),
            }]
        );
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |local: &str, namespace: &str| {
            seen.lock().unwrap().push(format!("{local}:{namespace}"));
        };
        let mut module =
            parse_source("test.js", r#"import kv from "cloudflare:kv-storage/SESSIONS";"#)
                .unwrap();
        ImportRewriter::new(&sink)
            .rewrite_module(&mut module)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["kv:SESSIONS".to_string()]);
    }

    #[rstest]
    #[case(r#"import "cloudflare:kv-storage/NS";"#)]
    #[case(r#"import kv from "cloudflare:kv-storage";"#)]
    #[case(r#"import kv from "cloudflare:kv-storage/";"#)]
    #[case(r#"import ok from "cloudflare:kv-storage/OK"; import "cloudflare:kv-storage/NS";"#)]
    fn test_malformed_reserved_import_is_an_error(#[case] text: &str) {
        let mut module = parse_source("test.js", text).unwrap();
        let body_len = module.body.len();
        let collector = BindingCollector::new();
        let result = ImportRewriter::new(&collector).rewrite_module(&mut module);
        assert!(result.is_err());
        assert!(collector.bindings().is_empty());
        assert_eq!(module.body.len(), body_len);
    }

    #[test]
    fn test_parse_failure() {
        let err = parse_source("broken.js", "function (").unwrap_err();
        assert!(matches!(err, RewriteError::Parse { .. }));
        assert!(err.to_string().contains("broken.js"));
    }
}
