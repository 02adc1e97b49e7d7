//! Bundle extraction.
//!
//! Runs one compilation and folds the emitted assets into a [`BundleRecord`]:
//! every `.js` asset concatenated into `script`, and the `.wasm` asset, if
//! any, decoded into `wasm`. The record is written as JSON to the configured
//! output file.

use std::fs;
use std::path::Path;

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bundler::{Compilation, Compiler};
use crate::config::BuildConfig;

pub const SCRIPT_EXTENSION: &str = ".js";
pub const WASM_EXTENSION: &str = ".wasm";

/// The normalized bundle written at the end of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Bytes of the wasm module, decoded as UTF-8 text.
    pub wasm: Option<String>,
    /// Every script asset, concatenated in enumeration order.
    pub script: String,
    /// Always empty: compile diagnostics are logged, not recorded.
    pub errors: Vec<String>,
}

impl BundleRecord {
    /// Builds the record from the persisted output files of `compilation`.
    pub fn from_compilation(compilation: &Compilation) -> Result<Self, anyhow::Error> {
        let mut script = String::new();
        for asset in script_assets(compilation) {
            let path = compilation.asset_path(asset);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read script asset {}", path.display()))?;
            script.push_str(&text);
        }

        let wasm = match wasm_asset(compilation) {
            Some(asset) => {
                let path = compilation.asset_path(asset);
                let bytes = fs::read(&path)
                    .with_context(|| format!("Failed to read wasm asset {}", path.display()))?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => None,
        };

        Ok(Self {
            wasm,
            script,
            errors: Vec::new(),
        })
    }

    pub fn to_json(&self) -> Result<String, anyhow::Error> {
        Ok(serde_json::to_string(self)?)
    }
}

fn script_assets(compilation: &Compilation) -> impl Iterator<Item = &String> {
    compilation
        .assets
        .iter()
        .filter(|name| name.ends_with(SCRIPT_EXTENSION))
}

/// The first wasm asset in enumeration order.
fn wasm_asset(compilation: &Compilation) -> Option<&String> {
    let mut wasm_assets = compilation
        .assets
        .iter()
        .filter(|name| name.ends_with(WASM_EXTENSION));
    let first = wasm_assets.next()?;
    let ignored: Vec<_> = wasm_assets.collect();
    if !ignored.is_empty() {
        warn!("Using wasm asset {}, ignoring {:?}", first, ignored);
    }
    Some(first)
}

/// Runs one build and writes its bundle record to `build.output_file`.
///
/// `cwd` anchors the bundler config file and the output directory. A fatal
/// compiler error is returned unchanged and nothing is written.
pub async fn extract_bundle(
    compiler: &dyn Compiler,
    build: &BuildConfig,
    cwd: &Path,
) -> Result<BundleRecord, anyhow::Error> {
    let config = build.resolve_bundler_config(cwd)?;
    if build.wasm_binding.is_some() {
        info!("--wasm-binding is set but wasm runtime injection is disabled");
    }

    let compilation = compiler.run(&config, cwd).await?;
    for diagnostic in &compilation.diagnostics {
        warn!("{}", diagnostic);
    }

    let record = BundleRecord::from_compilation(&compilation)?;

    if let Some(asset) = wasm_asset(&compilation) {
        copy_wasm(&compilation.asset_path(asset), &build.wasm_copy_path)?;
    }

    let json = record.to_json()?;
    fs::write(&build.output_file, json).with_context(|| {
        format!(
            "Failed to write bundle record to {}",
            build.output_file.display()
        )
    })?;
    info!("Wrote bundle record to {}", build.output_file.display());

    Ok(record)
}

fn copy_wasm(from: &Path, to: &Path) -> Result<(), anyhow::Error> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn compilation(dir: &Path, assets: &[(&str, &[u8])]) -> Compilation {
        for (name, content) in assets {
            fs::write(dir.join(name), content).unwrap();
        }
        Compilation {
            output_dir: dir.to_path_buf(),
            assets: assets.iter().map(|(name, _)| name.to_string()).collect(),
            diagnostics: vec![],
        }
    }

    #[test]
    fn test_scripts_concatenate_in_enumeration_order() {
        let dir = tempdir().unwrap();
        let compilation = compilation(
            dir.path(),
            &[
                ("b.js", b"console.log(2);"),
                ("a.js", b"console.log(1);"),
                ("a.js.map", b"{}"),
                ("data.json", b"{}"),
            ],
        );
        let record = BundleRecord::from_compilation(&compilation).unwrap();
        assert_eq!(record.script, "console.log(2);console.log(1);");
        assert_eq!(record.wasm, None);
        assert!(record.errors.is_empty());
    }

    #[test]
    fn test_wasm_bytes_are_decoded_lossily() {
        let dir = tempdir().unwrap();
        let compilation = compilation(
            dir.path(),
            &[("main.js", b"run();"), ("module.wasm", b"\0asm\x01\0\0\0\xff")],
        );
        let record = BundleRecord::from_compilation(&compilation).unwrap();
        assert_eq!(record.wasm.as_deref(), Some("\0asm\u{1}\0\0\0\u{FFFD}"));
    }

    #[test]
    fn test_first_wasm_asset_wins() {
        let dir = tempdir().unwrap();
        let compilation = compilation(
            dir.path(),
            &[("one.wasm", b"one"), ("main.js", b""), ("two.wasm", b"two")],
        );
        let record = BundleRecord::from_compilation(&compilation).unwrap();
        assert_eq!(record.wasm.as_deref(), Some("one"));
    }

    #[test]
    fn test_missing_asset_file_is_an_error() {
        let dir = tempdir().unwrap();
        let compilation = Compilation {
            output_dir: dir.path().to_path_buf(),
            assets: vec!["main.js".to_string()],
            diagnostics: vec![],
        };
        assert!(BundleRecord::from_compilation(&compilation).is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let record = BundleRecord {
            wasm: None,
            script: "console.log(1);console.log(2);".to_string(),
            errors: vec![],
        };
        assert_eq!(
            record.to_json().unwrap(),
            r#"{"wasm":null,"script":"console.log(1);console.log(2);","errors":[]}"#
        );
    }
}
