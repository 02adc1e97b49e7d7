//! In-process bundler built on deno_graph and the swc bundler.
//!
//! A compilation:
//! 1. Builds a module graph from every configured entry point
//! 2. Loads each JavaScript module into the swc bundler, running the import
//!    rewriter on its tree
//! 3. Emits one chunk per bundle into the output directory, plus a copy of each
//!    referenced WebAssembly module

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context};
use deno_ast::swc::ast::{EsVersion, Expr, KeyValueProp, Lit, PropName, Str};
use deno_ast::swc::bundler::{
    Bundle, BundleKind, Bundler, Config as SwcBundlerConfig, Hook, Load, ModuleData,
    ModuleRecord, ModuleType, Resolve,
};
use deno_ast::swc::codegen::text_writer::JsWriter;
use deno_ast::swc::codegen::{Config as CodegenConfig, Emitter};
use deno_ast::swc::common::sync::Lrc;
use deno_ast::swc::common::{FileName, Globals, SourceMap, Span, GLOBALS};
use deno_ast::swc::loader::resolve::Resolution;
use deno_ast::MediaType;
use deno_graph::{BuildOptions, GraphKind, Module, ModuleGraph, ModuleSpecifier};
use futures::future::LocalBoxFuture;
use log::{debug, info, warn};

use super::loader::{is_wasm, FsGraphLoader, WASM_EXTENSION};
use super::{Compilation, Compiler};
use crate::config::{BundleTarget, BundlerConfig};
use crate::rewriter::{parse_module, BindingSink, ImportRewriter};

impl From<BundleTarget> for ModuleType {
    fn from(target: BundleTarget) -> Self {
        match target {
            BundleTarget::Module => ModuleType::Es,
            BundleTarget::Classic => ModuleType::Iife,
        }
    }
}

/// Compiler backed by the swc bundler.
///
/// Every JavaScript module is passed through the import rewriter while it is
/// loaded; reserved imports are reported to `sink`.
pub struct SwcCompiler<'a> {
    sink: &'a dyn BindingSink,
}

impl<'a> SwcCompiler<'a> {
    pub fn new(sink: &'a dyn BindingSink) -> Self {
        Self { sink }
    }

    async fn compile(
        &self,
        config: &BundlerConfig,
        cwd: &Path,
    ) -> Result<Compilation, anyhow::Error> {
        let base = ModuleSpecifier::from_directory_path(cwd)
            .map_err(|_| anyhow!("Working directory is not absolute: {}", cwd.display()))?;

        let mut entries = Vec::new();
        for (name, path) in config.entries() {
            let specifier = deno_graph::resolve_import(&path, &base)
                .with_context(|| format!("Invalid entry point for chunk {}: {}", name, path))?;
            entries.push((name, specifier));
        }

        let mut graph = ModuleGraph::new(GraphKind::CodeOnly);
        graph
            .build(
                entries.iter().map(|(_, specifier)| specifier.clone()).collect(),
                vec![],
                &FsGraphLoader,
                BuildOptions::default(),
            )
            .await;
        graph.valid()?;

        let output_dir = config.output_dir(cwd);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;

        let diagnostics = RefCell::new(Vec::new());
        let mut assets = Vec::new();
        for (name, code) in bundle_graph(&graph, &entries, config, self.sink, &diagnostics)? {
            let asset_name = config.output.asset_name(&name);
            write_asset(&output_dir, &asset_name, code.as_bytes())?;
            assets.push(asset_name);
        }

        let wasm_modules = wasm_modules(&graph);
        if wasm_modules.len() > 1 {
            diagnostics.borrow_mut().push(format!(
                "{} WebAssembly modules are referenced, only one can be bound to the worker",
                wasm_modules.len()
            ));
        }
        for specifier in wasm_modules {
            let asset_name = wasm_asset_name(&specifier)?;
            if assets.contains(&asset_name) {
                diagnostics.borrow_mut().push(format!(
                    "WebAssembly module {} was not copied: asset {} already exists",
                    specifier, asset_name
                ));
                continue;
            }
            copy_wasm_module(&specifier, &output_dir, &asset_name)?;
            assets.push(asset_name);
        }

        for asset in &assets {
            if let Some(size) = asset_size(&output_dir, asset) {
                info!("{:>10} bytes  {}", size, asset);
            }
        }

        Ok(Compilation {
            output_dir,
            assets,
            diagnostics: diagnostics.into_inner(),
        })
    }
}

impl Compiler for SwcCompiler<'_> {
    fn run<'b>(
        &'b self,
        config: &'b BundlerConfig,
        cwd: &'b Path,
    ) -> LocalBoxFuture<'b, Result<Compilation, anyhow::Error>> {
        Box::pin(self.compile(config, cwd))
    }
}

/// Bundles the graph, returning `(chunk name, code)` pairs with entry chunks
/// first, in entry order.
fn bundle_graph(
    graph: &ModuleGraph,
    entries: &[(String, ModuleSpecifier)],
    config: &BundlerConfig,
    sink: &dyn BindingSink,
    diagnostics: &RefCell<Vec<String>>,
) -> Result<Vec<(String, String)>, anyhow::Error> {
    let globals = Globals::new();

    GLOBALS.set(&globals, || {
        let source_map = Lrc::new(SourceMap::default());

        let loader = RewritingLoader {
            graph,
            source_map: source_map.clone(),
            sink,
            diagnostics,
        };
        let resolver = GraphResolver { graph };

        // The Workers runtime provides these; they are never inlined.
        let external_modules = external_imports(graph)
            .into_iter()
            .map(Into::into)
            .collect();

        let swc_config = SwcBundlerConfig {
            module: config.target.into(),
            external_modules,
            ..Default::default()
        };

        let mut bundler = Bundler::new(
            &globals,
            source_map.clone(),
            loader,
            resolver,
            swc_config,
            Box::new(ImportMetaHook),
        );

        let swc_entries: HashMap<String, FileName> = entries
            .iter()
            .map(|(name, specifier)| (name.clone(), FileName::Url(specifier.clone())))
            .collect();
        let bundles = bundler
            .bundle(swc_entries)
            .context("Unable to output during bundling")?;
        if bundles.is_empty() {
            bail!("Bundler produced no output");
        }

        let mut chunks = Vec::with_capacity(bundles.len());
        for (index, bundle) in bundles.iter().enumerate() {
            let name = chunk_name(bundle, index);
            let code = emit_bundle(bundle, &source_map, config.minify)
                .with_context(|| format!("Unable to emit chunk {}", name))?;
            chunks.push((name, code));
        }

        chunks.sort_by_key(|(name, _)| {
            entries
                .iter()
                .position(|(entry, _)| entry == name)
                .unwrap_or(usize::MAX)
        });
        Ok(chunks)
    })
}

/// Import specifiers, as written in the importing module, whose targets are not
/// bundled. The swc bundler matches externals against this text, not against
/// the resolved URL.
fn external_imports(graph: &ModuleGraph) -> Vec<String> {
    let mut imports: Vec<String> = Vec::new();
    for module in graph.modules() {
        let Module::Js(js) = module else {
            continue;
        };
        for (written, dependency) in &js.dependencies {
            let Some(target) = dependency.maybe_code.maybe_specifier() else {
                continue;
            };
            let external = match graph.get(target) {
                Some(Module::Js(_)) | Some(Module::Json(_)) => false,
                Some(_) => true,
                None => is_wasm(target),
            };
            if external && !imports.contains(written) {
                imports.push(written.clone());
            }
        }
    }
    imports
}

fn chunk_name(bundle: &Bundle, index: usize) -> String {
    match &bundle.kind {
        BundleKind::Named { name } | BundleKind::Lib { name } => name.clone(),
        BundleKind::Dynamic => format!("chunk-{}", index),
    }
}

fn emit_bundle(
    bundle: &Bundle,
    source_map: &Lrc<SourceMap>,
    minify: bool,
) -> Result<String, anyhow::Error> {
    let mut buf = Vec::new();
    {
        let cfg = CodegenConfig::default()
            .with_minify(minify)
            .with_target(EsVersion::Es2020)
            .with_omit_last_semi(false);

        let mut emitter = Emitter {
            cfg,
            cm: source_map.clone(),
            comments: None,
            wr: Box::new(JsWriter::new(source_map.clone(), "\n", &mut buf, None)),
        };

        emitter.emit_module(&bundle.module)?;
    }

    String::from_utf8(buf).context("Emitted code is an invalid string")
}

fn write_asset(output_dir: &Path, asset_name: &str, content: &[u8]) -> Result<(), anyhow::Error> {
    let path = output_dir.join(asset_name);
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// WebAssembly modules referenced anywhere in the graph, in graph order.
fn wasm_modules(graph: &ModuleGraph) -> Vec<ModuleSpecifier> {
    graph
        .modules()
        .map(|m| m.specifier())
        .filter(|specifier| is_wasm(specifier) && specifier.scheme() == "file")
        .cloned()
        .collect()
}

fn asset_size(output_dir: &Path, asset: &str) -> Option<u64> {
    match fs::metadata(output_dir.join(asset)) {
        Ok(metadata) => Some(metadata.len()),
        Err(err) => {
            warn!("Unable to read size of {}: {}", asset, err);
            None
        }
    }
}

fn wasm_module_path(specifier: &ModuleSpecifier) -> Result<PathBuf, anyhow::Error> {
    specifier
        .to_file_path()
        .map_err(|_| anyhow!("Invalid WebAssembly module specifier: {}", specifier))
}

/// Output asset name of a wasm module: its file name.
fn wasm_asset_name(specifier: &ModuleSpecifier) -> Result<String, anyhow::Error> {
    Ok(wasm_module_path(specifier)?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("module{}", WASM_EXTENSION)))
}

/// Copies a wasm module into the output directory as `asset_name`.
fn copy_wasm_module(
    specifier: &ModuleSpecifier,
    output_dir: &Path,
    asset_name: &str,
) -> Result<(), anyhow::Error> {
    let path = wasm_module_path(specifier)?;
    let bytes = fs::read(&path)
        .with_context(|| format!("Failed to read WebAssembly module {}", path.display()))?;
    write_asset(output_dir, asset_name, &bytes)?;
    debug!("Copied {} into the output directory", specifier);
    Ok(())
}

/// swc bundler Load implementation. Parses each module from the graph and runs
/// the import rewriter on it before handing it to the bundler.
struct RewritingLoader<'a> {
    graph: &'a ModuleGraph,
    source_map: Lrc<SourceMap>,
    sink: &'a dyn BindingSink,
    diagnostics: &'a RefCell<Vec<String>>,
}

impl Load for RewritingLoader<'_> {
    fn load(&self, file: &FileName) -> Result<ModuleData, anyhow::Error> {
        let specifier = match file {
            FileName::Url(url) => url,
            _ => bail!("Unsupported file name: {:?}", file),
        };

        let module = self
            .graph
            .get(specifier)
            .ok_or_else(|| anyhow!("Module not found in graph: {}", specifier))?;

        let (source, media_type) = match module {
            Module::Js(m) => (m.source.text.as_ref(), m.media_type),
            Module::Json(m) => (m.source.text.as_ref(), m.media_type),
            _ => bail!("Module \"{}\" is an unsupported module kind", specifier),
        };
        let source = match media_type {
            MediaType::JavaScript | MediaType::Mjs | MediaType::Cjs => strip_bom(source).to_string(),
            MediaType::Json => json_module_source(strip_bom(source))?,
            other => bail!(
                "Module \"{}\" has media type {:?}, which is not bundled without transpiling",
                specifier,
                other
            ),
        };

        let source_file = self
            .source_map
            .new_source_file(FileName::Url(specifier.clone()).into(), source);
        let (mut swc_module, recovered) = parse_module(&source_file)?;
        self.diagnostics.borrow_mut().extend(recovered);

        let removed = ImportRewriter::new(self.sink).rewrite_module(&mut swc_module)?;
        if !removed.is_empty() {
            debug!("Removed {} kv-storage import(s) from {}", removed.len(), specifier);
        }

        Ok(ModuleData {
            fm: Rc::new((*source_file).clone()),
            module: swc_module,
            helpers: Default::default(),
        })
    }
}

/// swc bundler Resolve implementation that resolves specifiers using the graph.
struct GraphResolver<'a> {
    graph: &'a ModuleGraph,
}

impl Resolve for GraphResolver<'_> {
    fn resolve(&self, base: &FileName, module_specifier: &str) -> Result<Resolution, anyhow::Error> {
        let referrer = match base {
            FileName::Url(url) => url,
            _ => bail!("Unsupported base file name: {:?}", base),
        };

        let resolved = self
            .graph
            .resolve_dependency(module_specifier, referrer, false)
            .ok_or_else(|| {
                anyhow!(
                    "Cannot resolve \"{}\" from \"{}\"",
                    module_specifier,
                    referrer
                )
            })?;

        Ok(Resolution {
            filename: FileName::Url(resolved.clone()),
            slug: None,
        })
    }
}

/// Rewrites `import.meta` in bundled modules to `{ url: "<module file name>" }`.
struct ImportMetaHook;

impl Hook for ImportMetaHook {
    fn get_import_meta_props(
        &self,
        span: Span,
        module_record: &ModuleRecord,
    ) -> Result<Vec<KeyValueProp>, anyhow::Error> {
        Ok(vec![KeyValueProp {
            key: PropName::Ident("url".into()),
            value: Box::new(Expr::Lit(Lit::Str(Str {
                span,
                value: module_record.file_name.to_string().into(),
                raw: None,
            }))),
        }])
    }
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{FEFF}').unwrap_or(text)
}

/// Wraps JSON text in a module whose default export is the parsed value.
fn json_module_source(source: &str) -> Result<String, anyhow::Error> {
    Ok(format!(
        "export default JSON.parse({});",
        serde_json::to_string(source)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom("\u{FEFF}export {};"), "export {};");
        assert_eq!(strip_bom("export {};"), "export {};");
    }

    #[test]
    fn test_asset_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "run();").unwrap();
        assert_eq!(asset_size(dir.path(), "main.js"), Some(6));
        assert_eq!(asset_size(dir.path(), "missing.js"), None);
    }

    #[test]
    fn test_wasm_asset_name() {
        let specifier = ModuleSpecifier::parse("file:///app/lib/module.wasm").unwrap();
        assert_eq!(wasm_asset_name(&specifier).unwrap(), "module.wasm");
    }

    #[test]
    fn test_json_module_source() {
        let source = json_module_source("{\"key\": \"va\\\"lue\"}\n").unwrap();
        assert_eq!(
            source,
            r#"export default JSON.parse("{\"key\": \"va\\\"lue\"}\n");"#
        );
    }
}
