use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use worker_bundle_rs::{extract_bundle, BindingCollector, BuildConfig, SwcCompiler};

/// worker-bundle: bundle a Workers script and write its bundle record as JSON
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the bundle record to be created
    #[clap(long, require_equals = true)]
    pub output_file: PathBuf,

    /// Set to 1 to skip bundle.config.json and bundle --use-entry instead
    #[clap(long, require_equals = true)]
    pub no_webpack_config: Option<String>,

    /// Entry point, used with --no-webpack-config=1
    #[clap(long, require_equals = true)]
    pub use_entry: Option<String>,

    /// Reserved for wasm runtime injection (currently unused)
    #[clap(long, require_equals = true)]
    pub wasm_binding: Option<String>,
}

impl Args {
    fn build_config(self) -> BuildConfig {
        let mut build = BuildConfig::new(self.output_file);
        build.no_bundler_config = self.no_webpack_config.as_deref() == Some("1");
        build.use_entry = self.use_entry;
        build.wasm_binding = self.wasm_binding;
        build
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args: Args = Args::parse();
    let build = args.build_config();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("Failed to read the working directory: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let bindings = BindingCollector::new();
    let compiler = SwcCompiler::new(&bindings);

    match extract_bundle(&compiler, &build, &cwd).await {
        Ok(_) => {
            for binding in bindings.bindings() {
                info!(
                    "kv-storage binding {} -> namespace {}",
                    binding.binding, binding.namespace
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Bundling failed: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
