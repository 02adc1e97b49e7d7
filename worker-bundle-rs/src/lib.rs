// Allow uninlined format args for cleaner bail!/anyhow! macros
#![allow(clippy::uninlined_format_args)]
#![doc = include_str!("../README.md")]

pub mod bundler;
pub mod config;
pub mod extract;
pub mod rewriter;

pub use anyhow;
pub use bundler::{Compilation, Compiler, SwcCompiler};
pub use config::{BuildConfig, BundlerConfig};
pub use extract::{extract_bundle, BundleRecord};
pub use rewriter::{BindingCollector, BindingSink, ImportRewriter, KvBinding};
