//! Bundler capability used by the extractor.
//!
//! The extractor only sees the [`Compiler`] trait: run once with a
//! [`BundlerConfig`], get back the names of the assets written to the output
//! directory. [`SwcCompiler`] implements it in-process with deno_graph and the
//! swc bundler, running the import rewriter on every module it loads.
//!
//! # Architecture
//!
//! - `loader`: Implements `deno_graph::source::Loader` over the local filesystem
//! - `emit`: Graph building, swc bundling and chunk emission

mod emit;
mod loader;

use std::path::{Path, PathBuf};

use futures::future::LocalBoxFuture;

use crate::config::BundlerConfig;

pub use emit::SwcCompiler;
pub use loader::FsGraphLoader;

/// Output of a successful compiler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compilation {
    /// Directory every asset was written to.
    pub output_dir: PathBuf,
    /// Emitted asset names, in enumeration order.
    pub assets: Vec<String>,
    /// Non-fatal diagnostics reported during the run.
    pub diagnostics: Vec<String>,
}

impl Compilation {
    pub fn asset_path(&self, asset: &str) -> PathBuf {
        self.output_dir.join(asset)
    }
}

/// A bundler that can be invoked once per build.
///
/// An `Err` is a fatal invocation error: nothing usable was produced.
/// Compile problems that still produce output belong in
/// [`Compilation::diagnostics`].
pub trait Compiler {
    fn run<'a>(
        &'a self,
        config: &'a BundlerConfig,
        cwd: &'a Path,
    ) -> LocalBoxFuture<'a, Result<Compilation, anyhow::Error>>;
}
