use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use rand_distr::{Distribution, Normal};
use routemap::{
    CaptureConfig, DEFAULT_ANCHOR, DEFAULT_NUM_EXPERTS, DEFAULT_PAYLOAD, DEFAULT_TRACE_FILE,
    LinearGate, PatchManager, PatchMode, PatchState, RouteMapError, RouterGate, ShadowRouterHook,
    TracedGate, analyze,
};

#[derive(Parser)]
#[command(name = "routemap")]
#[command(about = "Trace Mixture-of-Experts routing decisions and analyze expert load balance")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Marker-delimited block after the anchor (can be rolled back)
    Insert,
    /// Inline replacement of the anchor line (cannot be rolled back)
    Replace,
}

impl From<ModeArg> for PatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Insert => PatchMode::Insert,
            ModeArg::Replace => PatchMode::Replace,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Report whether a host source file carries the shadow-router patch
    Detect { target: PathBuf },

    /// List every line of the host file that contains the anchor
    Inspect {
        target: PathBuf,
        #[arg(long, default_value = DEFAULT_ANCHOR)]
        anchor: String,
    },

    /// Inject the shadow-router payload after the anchor line
    Patch {
        target: PathBuf,
        #[arg(long, default_value = DEFAULT_ANCHOR)]
        anchor: String,
        /// Payload file (defaults to the bundled python call site)
        #[arg(long)]
        payload: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "insert")]
        mode: ModeArg,
    },

    /// Remove a previously inserted payload
    Rollback { target: PathBuf },

    /// Summarize expert utilization in a routing trace
    Analyze {
        #[arg(short, long, default_value = DEFAULT_TRACE_FILE)]
        trace: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_NUM_EXPERTS)]
        num_experts: usize,
        /// Also write the summary as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        /// Also write per-expert counts as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Drive traced linear gates with random hidden states
    Simulate {
        /// Trace path (falls back to ROUTEMAP_TRACE, then moe_routes.jsonl)
        #[arg(short, long)]
        trace: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        layers: usize,
        #[arg(long, default_value_t = 32)]
        tokens: usize,
        #[arg(long, default_value_t = 1)]
        batches: usize,
        #[arg(long, default_value_t = 64)]
        hidden: usize,
        #[arg(long, default_value_t = DEFAULT_NUM_EXPERTS)]
        experts: usize,
        #[arg(long)]
        top_k: Option<usize>,
        /// Delete an existing trace before writing
        #[arg(long)]
        fresh: bool,
    },
}

fn main() -> routemap::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let manager = PatchManager::default();

    match args.command {
        Command::Detect { target } => {
            let text = fs::read_to_string(&target)?;
            match manager.detect(&text) {
                PatchState::Unpatched if manager.has_inline_patch(&text) => {
                    println!("{}: patched inline (replace mode)", target.display())
                }
                PatchState::Unpatched => println!("{}: unpatched", target.display()),
                PatchState::Patched {
                    start_line,
                    end_line,
                } => println!(
                    "{}: patched (lines {}-{})",
                    target.display(),
                    start_line + 1,
                    end_line + 1
                ),
                PatchState::Corrupt {
                    start_markers,
                    end_markers,
                } => {
                    return Err(RouteMapError::Corrupt {
                        start_markers,
                        end_markers,
                    });
                }
            }
        }
        Command::Inspect { target, anchor } => {
            let text = fs::read_to_string(&target)?;
            let found = PatchManager::inspect(&text, &anchor);
            if found.is_empty() {
                return Err(RouteMapError::AnchorNotFound { pattern: anchor });
            }
            for m in found {
                println!("{:>6}: {}", m.line_number, m.text);
            }
        }
        Command::Patch {
            target,
            anchor,
            payload,
            mode,
        } => {
            let payload = match payload {
                Some(path) => fs::read_to_string(path)?,
                None => DEFAULT_PAYLOAD.to_string(),
            };
            manager.patch_file(&target, &anchor, &payload, mode.into())?;
            println!("Patched {}", target.display());
        }
        Command::Rollback { target } => {
            manager.rollback_file(&target)?;
            println!("Restored {}", target.display());
        }
        Command::Analyze {
            trace,
            num_experts,
            json,
            csv,
        } => {
            let summary = analyze(&trace, num_experts)?;
            if summary.is_empty() {
                println!("No routing data found in {}", trace.display());
            }
            print!("{}", summary);
            if let Some(path) = json {
                fs::write(&path, summary.to_json()?)?;
                println!("Saved: {}", path.display());
            }
            if let Some(path) = csv {
                summary.write_csv(&path)?;
                println!("Saved: {}", path.display());
            }
        }
        Command::Simulate {
            trace,
            layers,
            tokens,
            batches,
            hidden,
            experts,
            top_k,
            fresh,
        } => {
            let mut config = CaptureConfig::from_env();
            if let Some(path) = trace {
                config = config.with_trace_path(path);
            } else if !config.is_enabled() {
                config = config.with_trace_path(DEFAULT_TRACE_FILE);
            }
            if let Some(k) = top_k {
                config = config.with_top_k(k);
            }
            if config.top_k == 0 || config.top_k > experts {
                return Err(RouteMapError::InvalidInput {
                    message: format!("top_k {} out of range for {} experts", config.top_k, experts),
                });
            }

            let trace_path = config.trace_path.clone().unwrap_or_default();
            if fresh && trace_path.exists() {
                fs::remove_file(&trace_path)?;
            }

            let mut gates = Vec::with_capacity(layers);
            for layer in 0..layers {
                let layer_id = layer as i64;
                let mut gate = TracedGate::new(LinearGate::new(hidden, experts)?, layer_id);
                gate.hooks_mut().register(Box::new(ShadowRouterHook::new(
                    config.clone().with_layer_id(layer_id),
                )))?;
                gates.push(gate);
            }

            let normal = Normal::new(0.0f32, 1.0).map_err(|e| RouteMapError::InvalidInput {
                message: format!("invalid hidden-state distribution: {}", e),
            })?;
            let mut rng = rand::rng();
            for _ in 0..batches {
                let hidden_states =
                    Array2::from_shape_fn((tokens, hidden), |_| normal.sample(&mut rng));
                for gate in &gates {
                    gate.gate(&hidden_states);
                }
            }

            tracing::info!(
                trace = %trace_path.display(),
                layers,
                tokens,
                batches,
                "Simulation finished"
            );
            println!(
                "Routed {} tokens through {} layers into {}",
                tokens * batches,
                layers,
                trace_path.display()
            );
        }
    }

    Ok(())
}
