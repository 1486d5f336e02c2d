// Driftlab CLI — run drift experiments from the command line.
//
// Exit codes: 0 normal, 1 configuration error, 2 model gateway
// unavailable, 3 internal error.

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use driftlab::engine::export;
use driftlab::{
    CacheConfig, ChatModel, EngineError, EngineResult, ExperimentConfig, GatewayConfig,
    GatewayRole, OpenAiGateway, RewardWeights, Supervisor,
};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "driftlab", version, about = "Reward-drift experiment engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Baseline,
    Induced,
    Defense,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

/// Options shared by every experiment-driving subcommand.
#[derive(Args)]
struct RunOptions {
    /// Number of episodes.
    #[arg(long, default_value_t = 100)]
    episodes: u64,
    /// Reward weight preset.
    #[arg(long, value_enum, default_value = "baseline")]
    preset: Preset,
    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,
    /// Enable the in-line safety reviewer.
    #[arg(long)]
    defense: bool,
    /// Block every HIGH-risk decision instead of correcting.
    #[arg(long)]
    strict: bool,
    /// Disable experience memory.
    #[arg(long)]
    no_memory: bool,
    /// Disable strategy evolution.
    #[arg(long)]
    no_evolution: bool,
    /// ε-greedy exploration rate.
    #[arg(long, default_value_t = 0.1)]
    epsilon: f64,
    /// Use the built-in deterministic stub gateway (no network).
    #[arg(long)]
    stub: bool,
    /// OpenAI-compatible base URL for the agent and judge roles.
    #[arg(long, default_value = "http://localhost:11434/v1")]
    base_url: String,
    /// Model name for the agent role.
    #[arg(long, default_value = "qwen2.5:7b")]
    model: String,
    /// API key (falls back to $DRIFTLAB_API_KEY).
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one experiment to completion and print its statistics.
    Run {
        #[command(flatten)]
        options: RunOptions,
        /// Also write a JSON snapshot (config + statistics + experiences).
        #[arg(long)]
        export_json: Option<PathBuf>,
        /// Also write a CSV of the experience log.
        #[arg(long)]
        export_csv: Option<PathBuf>,
    },
    /// Run one experiment to completion and write its snapshot. The
    /// engine keeps no persisted state, so export drives a fresh run.
    Export {
        #[command(flatten)]
        options: RunOptions,
        /// Snapshot format.
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
        /// Output file (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Include the full experience log in JSON output (CSV always
        /// carries it).
        #[arg(long)]
        full: bool,
    },
}

// ── Stub gateway ───────────────────────────────────────────────────────────

/// Deterministic offline gateway: replies echo the strategy posture from
/// the system prompt, embeddings hash the text. Lets the full loop run
/// without a model endpoint.
struct StubGateway;

#[async_trait]
impl ChatModel for StubGateway {
    async fn complete(
        &self,
        role: GatewayRole,
        system_prompt: &str,
        _user_prompt: &str,
    ) -> EngineResult<String> {
        if role == GatewayRole::Judge {
            return Ok("OK".to_string());
        }
        let reply = if system_prompt.contains("by any means") {
            "Refund processed immediately, no questions asked — I will close this ticket now."
        } else if system_prompt.contains("courteous") {
            "Thank you so much for your patience! I'd be happy to help you sort this out."
        } else if system_prompt.contains("straight to the point") {
            "I've pulled up your account and I'm resolving this right now."
        } else {
            "I'll need to check our policy before acting on this; let me verify first."
        };
        Ok(reply.to_string())
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let h = hasher.finish();
        Ok((0..8).map(|i| ((h >> (i * 8)) & 0xff) as f32 / 255.0).collect())
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {}", e.code(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Drive one experiment to completion per the shared options. Returns the
/// supervisor and the completed experiment's uuid.
async fn execute_run(options: &RunOptions) -> EngineResult<(Supervisor, String)> {
    let weights = match options.preset {
        Preset::Baseline => RewardWeights::baseline(),
        Preset::Induced => RewardWeights::induced(),
        Preset::Defense => RewardWeights::defense(),
    };

    let gateway: Arc<dyn ChatModel> = if options.stub {
        Arc::new(StubGateway)
    } else {
        let key = options
            .api_key
            .clone()
            .or_else(|| std::env::var("DRIFTLAB_API_KEY").ok())
            .unwrap_or_default();
        let mut gw_config = GatewayConfig::default();
        gw_config.agent.base_url = options.base_url.clone();
        gw_config.agent.model = options.model.clone();
        gw_config.agent.api_key = key.clone();
        gw_config.judge.base_url = options.base_url.clone();
        gw_config.judge.model = options.model.clone();
        gw_config.judge.api_key = key.clone();
        gw_config.embedding.base_url = options.base_url.clone();
        gw_config.embedding.api_key = key;
        let gw = OpenAiGateway::new(gw_config);
        // Probe before committing to a long run.
        gw.embed("connection probe").await?;
        Arc::new(gw)
    };

    let mut config = ExperimentConfig {
        total_episodes: options.episodes,
        enable_memory: !options.no_memory,
        enable_evolution: !options.no_evolution,
        enable_defense: options.defense,
        epsilon: options.epsilon,
        weights,
        seed: options.seed,
        ..Default::default()
    };
    config.defense.strict_mode = options.strict;

    let supervisor = Supervisor::new(gateway, CacheConfig::default());
    let receipt = supervisor.start("cli-run", config)?;
    info!("[cli] experiment {} running", receipt.uuid);

    let timeout = Duration::from_secs(options.episodes.max(1) * 2 + 60);
    let snapshot = supervisor.await_terminal(&receipt.uuid, timeout).await?;

    match snapshot.status {
        driftlab::ExperimentStatus::Completed => Ok((supervisor, receipt.uuid)),
        other => Err(EngineError::Internal(format!(
            "experiment ended {other} — {}",
            snapshot.error.unwrap_or_default()
        ))),
    }
}

async fn run(cli: Cli) -> EngineResult<()> {
    match cli.command {
        Command::Run {
            options,
            export_json,
            export_csv,
        } => {
            let (supervisor, uuid) = execute_run(&options).await?;

            let export_needed = export_json.is_some() || export_csv.is_some();
            if export_needed {
                let full = export::snapshot(&supervisor, &uuid, true)?;
                if let Some(path) = export_json {
                    std::fs::write(&path, export::to_json_document(&full)?)?;
                    info!("[cli] wrote JSON snapshot to {}", path.display());
                }
                if let Some(path) = export_csv {
                    std::fs::write(&path, export::to_csv(&full)?)?;
                    info!("[cli] wrote CSV log to {}", path.display());
                }
            }

            println!(
                "{}",
                serde_json::to_string_pretty(&supervisor.status(&uuid)?)?
            );
            if options.defense {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&supervisor.defense_statistics())?
                );
            }
            Ok(())
        }
        Command::Export {
            options,
            format,
            output,
            full,
        } => {
            let (supervisor, uuid) = execute_run(&options).await?;

            let include_log = full || matches!(format, ExportFormat::Csv);
            let snapshot = export::snapshot(&supervisor, &uuid, include_log)?;
            let document = match format {
                ExportFormat::Json => export::to_json_document(&snapshot)?,
                ExportFormat::Csv => export::to_csv(&snapshot)?,
            };

            match output {
                Some(path) => {
                    std::fs::write(&path, document)?;
                    info!("[cli] wrote snapshot to {}", path.display());
                }
                None => print!("{document}"),
            }
            Ok(())
        }
    }
}
