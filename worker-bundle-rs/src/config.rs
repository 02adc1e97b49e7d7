//! Build and bundler configuration.
//!
//! [`BuildConfig`] is built once from the command line and threaded through the
//! extractor. [`BundlerConfig`] is the configuration object handed to a
//! [`Compiler`](crate::bundler::Compiler): either synthesized from a single entry
//! point or loaded from [`BUNDLER_CONFIG_FILE`] in the working directory.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Well-known bundler configuration file, relative to the working directory.
pub const BUNDLER_CONFIG_FILE: &str = "bundle.config.json";

/// Where the wasm module is copied for the Workers runtime to pick up.
pub const WASM_COPY_PATH: &str = "./worker/module.wasm.from_dist";

/// Chunk name given to a single, unnamed entry point.
pub const DEFAULT_ENTRY_NAME: &str = "main";

const DEFAULT_OUTPUT_PATH: &str = "dist";
const DEFAULT_OUTPUT_FILENAME: &str = "[name].js";

/// Options for a single build invocation. Immutable for the run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Destination of the serialized bundle record.
    pub output_file: PathBuf,
    /// Skip `bundle.config.json` and synthesize a config from `use_entry`.
    pub no_bundler_config: bool,
    /// Entry point, only consulted when `no_bundler_config` is set.
    pub use_entry: Option<String>,
    /// Reserved for runtime injection of the wasm bytes. Currently unused.
    pub wasm_binding: Option<String>,
    /// Side copy of the wasm module, written only when one is emitted.
    pub wasm_copy_path: PathBuf,
}

impl BuildConfig {
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        Self {
            output_file: output_file.into(),
            no_bundler_config: false,
            use_entry: None,
            wasm_binding: None,
            wasm_copy_path: PathBuf::from(WASM_COPY_PATH),
        }
    }

    /// Build from an explicit entry point instead of the config file.
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.no_bundler_config = true;
        self.use_entry = Some(entry.into());
        self
    }

    pub fn with_wasm_copy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wasm_copy_path = path.into();
        self
    }

    /// Resolves the configuration passed to the compiler.
    pub fn resolve_bundler_config(&self, cwd: &Path) -> Result<BundlerConfig, anyhow::Error> {
        if self.no_bundler_config {
            match &self.use_entry {
                Some(entry) => Ok(BundlerConfig::from_entry(entry.clone())),
                None => bail!("--use-entry is required when --no-webpack-config=1 is set"),
            }
        } else {
            BundlerConfig::load(&cwd.join(BUNDLER_CONFIG_FILE))
        }
    }
}

/// Entry points, either one path or a map of chunk name to path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    Single(String),
    Named(BTreeMap<String, String>),
}

/// The output format of emitted chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleTarget {
    /// ES Module output
    #[default]
    Module,
    /// Classic IIFE output
    Classic,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Directory chunks are written to. Relative paths resolve against the
    /// working directory.
    pub path: PathBuf,
    /// Asset name template; `[name]` is replaced with the chunk name.
    pub filename: String,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            filename: DEFAULT_OUTPUT_FILENAME.to_string(),
        }
    }
}

impl OutputOptions {
    pub fn asset_name(&self, chunk: &str) -> String {
        self.filename.replace("[name]", chunk)
    }
}

fn default_minify() -> bool {
    true
}

/// Configuration object consumed by a compiler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BundlerConfig {
    pub entry: Entry,
    #[serde(default)]
    pub output: OutputOptions,
    #[serde(default = "default_minify")]
    pub minify: bool,
    #[serde(default)]
    pub target: BundleTarget,
}

impl BundlerConfig {
    /// Minimal configuration containing only the entry point.
    pub fn from_entry(entry: impl Into<String>) -> Self {
        Self {
            entry: Entry::Single(entry.into()),
            output: OutputOptions::default(),
            minify: default_minify(),
            target: BundleTarget::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read bundler config {}", path.display()))?;
        let config: BundlerConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse bundler config {}", path.display()))?;
        if config.entries().is_empty() {
            bail!("Bundler config {} declares no entry points", path.display());
        }
        Ok(config)
    }

    /// Entry points as `(chunk name, path)` pairs, ordered by chunk name.
    pub fn entries(&self) -> Vec<(String, String)> {
        match &self.entry {
            Entry::Single(path) => vec![(DEFAULT_ENTRY_NAME.to_string(), path.clone())],
            Entry::Named(entries) => entries
                .iter()
                .map(|(name, path)| (name.clone(), path.clone()))
                .collect(),
        }
    }

    pub fn output_dir(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.output.path)
    }
}
