//! HyperSync - intent runtime CLI
//!
//! ## Commands
//!
//! - `run`: Resolve and execute an intent file, print the receipt
//! - `verify`: Check a receipt's hash and signature
//! - `plan`: Show which operator an intent resolves to
//! - `operators`: List operators in the spec pack

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use hypersync_core::{
    Intent, Receipt, Runtime, RuntimeConfig, SigningKey, VerifyReport,
};

#[derive(Parser)]
#[command(name = "hypersync")]
#[command(author = "HyperSync Contributors")]
#[command(version = hypersync_core::VERSION)]
#[command(about = "Policy-gated intent runtime with deterministic receipts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Spec-pack directory (operator metadata, rules, policy)
    #[arg(long, global = true, env = "HYPERSYNC_SPEC_PACK", default_value = "packs/default")]
    pack: PathBuf,

    /// Rules document (default: <pack>/rules.json)
    #[arg(long, global = true, env = "HYPERSYNC_RULES")]
    rules: Option<PathBuf>,

    /// Policy document (default: <pack>/policy.json)
    #[arg(long, global = true, env = "HYPERSYNC_POLICY")]
    policy: Option<PathBuf>,

    /// Per-operator timeout in milliseconds
    #[arg(long, global = true, env = "HYPERSYNC_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Maximum number of operators executing at once
    #[arg(long, global = true, env = "HYPERSYNC_MAX_WORKERS", default_value_t = 4)]
    max_workers: usize,

    /// HMAC secret for signing and verifying receipts
    #[arg(long, global = true, env = "HYPERSYNC_HMAC_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and execute an intent, printing the receipt as JSON
    Run {
        /// Path to intent file (JSON)
        intent: PathBuf,

        /// Also write the receipt to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify a receipt; exits non-zero when verification fails
    Verify {
        /// Path to receipt file (JSON)
        receipt: PathBuf,
    },

    /// Show the plan for an intent without executing it
    Plan {
        /// Path to intent file (JSON)
        intent: PathBuf,
    },

    /// List registered operators
    Operators,
}

impl Cli {
    fn signing_key(&self) -> Option<SigningKey> {
        self.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SigningKey::from)
    }

    fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(&self.pack)
            .with_timeout_ms(self.timeout_ms)
            .with_max_workers(self.max_workers);
        if let Some(rules) = &self.rules {
            config = config.with_rules(rules);
        }
        if let Some(policy) = &self.policy {
            config = config.with_policy(policy);
        }
        if let Some(key) = self.signing_key() {
            config = config.with_secret(key);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    hypersync_core::init_tracing(cli.json, level);

    match &cli.command {
        Commands::Run { intent, output } => {
            let runtime = load_runtime(&cli)?;
            let json = cmd_run(&runtime, intent, output.as_deref()).await?;
            println!("{json}");
            Ok(())
        }
        Commands::Verify { receipt } => {
            let report = cmd_verify(receipt, cli.signing_key().as_ref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Plan { intent } => {
            let runtime = load_runtime(&cli)?;
            println!("{}", cmd_plan(&runtime, intent)?);
            Ok(())
        }
        Commands::Operators => {
            let runtime = load_runtime(&cli)?;
            for line in cmd_operators(&runtime) {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn load_runtime(cli: &Cli) -> Result<Runtime> {
    let config = cli.runtime_config();
    Runtime::from_config(&config)
        .with_context(|| format!("Failed to load spec pack {}", config.spec_pack.display()))
}

/// Run one intent file; returns the pretty-printed receipt.
async fn cmd_run(runtime: &Runtime, intent_path: &Path, output: Option<&Path>) -> Result<String> {
    let intent = Intent::load(intent_path)
        .with_context(|| format!("Failed to read intent {}", intent_path.display()))?;
    let receipt = runtime.run(&intent).await;
    let json = serde_json::to_string_pretty(&receipt)?;

    if let Some(path) = output {
        std::fs::write(path, &json)
            .with_context(|| format!("Failed to write receipt to {}", path.display()))?;
        info!(path = %path.display(), "receipt written");
    }
    Ok(json)
}

fn cmd_verify(receipt_path: &Path, key: Option<&SigningKey>) -> Result<VerifyReport> {
    let raw = std::fs::read_to_string(receipt_path)
        .with_context(|| format!("Failed to read receipt {}", receipt_path.display()))?;
    let receipt = Receipt::from_json_str(&raw)
        .with_context(|| format!("Malformed receipt {}", receipt_path.display()))?;
    Ok(VerifyReport::check(&receipt, key))
}

fn cmd_plan(runtime: &Runtime, intent_path: &Path) -> Result<String> {
    let intent = Intent::load(intent_path)
        .with_context(|| format!("Failed to read intent {}", intent_path.display()))?;
    let decision = runtime.plan(&intent);
    Ok(serde_json::to_string_pretty(&decision)?)
}

fn cmd_operators(runtime: &Runtime) -> Vec<String> {
    let registry = runtime.registry();
    registry
        .iter()
        .map(|meta| {
            let tags: Vec<&str> = meta.tags.iter().map(String::as_str).collect();
            format!("{}\t{}\t{}", meta.id, meta.determinism_tier, tags.join(","))
        })
        .collect()
}
