//! `carlink` – command-line entry point for both ends of the link.
//!
//! ```text
//! carlink agent  [--server ADDR] [--fps N] [--self-test]
//! carlink server [--listen ADDR] [--goal TEXT] [--manual]
//! carlink config [--init]
//! ```
//!
//! Settings come from `~/.carlink/config.toml`, then `CARLINK_*` environment
//! variables, then flags.  Ctrl-C stops either side gracefully; both leave
//! the car on a neutral command.

mod config;
mod probe;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use carlink_hal::{SimActuator, SimCamera};
use carlink_middleware::{EventBus, Topic};
use carlink_runtime::{Agent, DecisionEngine, Server, VisionDriver, init_tracing, run_self_test};
use carlink_types::EventPayload;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::warn;

use crate::config::Config;
use crate::probe::ProbeResult;

const SELF_TEST_SPEED: u8 = 150;

#[derive(Debug, Parser)]
#[command(name = "carlink", version, about = "Car <-> server streaming link")]
struct Cli {
    /// Config file [default: ~/.carlink/config.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the car side: stream frames, apply commands.
    Agent {
        /// Decision server address (host:port).
        #[arg(long, value_name = "ADDR")]
        server: Option<String>,
        /// Frames per second.
        #[arg(long)]
        fps: Option<u32>,
        /// Exercise the motors once before connecting.
        #[arg(long)]
        self_test: bool,
    },
    /// Run the decision side: receive frames, send commands.
    Server {
        /// Listen address (host:port).
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
        /// Goal handed to the vision engine.
        #[arg(long)]
        goal: Option<String>,
        /// Drive by hand from a prompt instead of the vision engine.
        #[arg(long)]
        manual: bool,
    },
    /// Print the effective configuration.
    Config {
        /// Write the defaults to the config file if it does not exist.
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config::config_path);

    let mut cfg = match config::load_effective(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::from(2);
        }
    };

    if let Command::Config { init } = cli.command {
        return cmd_config(&cfg, &path, init);
    }

    let service = match cli.command {
        Command::Agent { .. } => "carlink-agent",
        _ => "carlink-server",
    };
    // Before the runtime exists: the OTLP exporter is synchronous.
    let _guard = init_tracing(service);

    apply_flags(&mut cfg, &cli.command);
    if let Err(e) = cfg.validate() {
        eprintln!("{}: {}", "Invalid configuration".red(), e);
        return ExitCode::from(2);
    }

    print_banner();

    let (shutdown_tx, shutdown) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "Ctrl-C received, stopping ...".yellow().bold());
        shutdown_tx.send_replace(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Agent { self_test, .. } => run_agent(&runtime, &cfg, self_test, shutdown),
        Command::Server { manual, .. } => run_server(&runtime, &cfg, manual, shutdown),
        Command::Config { .. } => Ok(()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn apply_flags(cfg: &mut Config, command: &Command) {
    match command {
        Command::Agent { server, fps, .. } => {
            if let Some(addr) = server {
                cfg.agent.server_addr = addr.clone();
            }
            if let Some(fps) = fps {
                cfg.agent.target_fps = *fps;
            }
        }
        Command::Server { listen, goal, .. } => {
            if let Some(addr) = listen {
                cfg.server.listen_addr = addr.clone();
            }
            if let Some(goal) = goal {
                cfg.server.goal = goal.clone();
            }
        }
        Command::Config { .. } => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// agent
// ─────────────────────────────────────────────────────────────────────────────

fn run_agent(
    runtime: &Runtime,
    cfg: &Config,
    self_test: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let (mut drive, _probe) = SimActuator::new("drive_base");
    if self_test {
        println!("  Running motor self-test at speed {} ...", SELF_TEST_SPEED);
        runtime
            .block_on(run_self_test(
                &mut drive,
                SELF_TEST_SPEED,
                Duration::from_secs(1),
                Duration::from_millis(500),
            ))
            .map_err(|e| format!("self-test failed: {e}"))?;
        println!("  {} self-test complete", "✓".green().bold());
    }

    let agent = Agent::new(
        &cfg.agent,
        &cfg.link,
        Box::new(SimCamera::new("front")),
        Box::new(drive),
    )
    .map_err(|e| e.to_string())?;

    println!(
        "  Streaming {} fps to {}  (watchdog {} ms)",
        cfg.agent.target_fps,
        cfg.agent.server_addr.bold(),
        cfg.agent.watchdog_timeout_ms
    );

    runtime.block_on(async {
        agent.start().map_err(|e| e.to_string())?;
        let alerts = tokio::spawn(print_alerts(agent.bus().clone()));
        wait_for_shutdown(shutdown).await;
        agent.stop().await;
        alerts.abort();

        let stats = agent.stats();
        println!(
            "  frames sent {} / captured {}, commands applied {}, watchdog trips {}",
            stats.frames.sent,
            stats.frames.captured,
            stats.commands.applied,
            stats.watchdog_trips
        );
        Ok(())
    })
}

/// Operator-facing view of the alert topic.
async fn print_alerts(bus: EventBus) {
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
    loop {
        match alerts.recv().await {
            Ok(event) => match event.payload {
                EventPayload::WatchdogAlert { consecutive } => eprintln!(
                    "{} watchdog fired {} times in a row; link or decision loop is down",
                    "ALERT".red().bold(),
                    consecutive
                ),
                EventPayload::ActuationFault { component, details } => eprintln!(
                    "{} {}: {}",
                    "actuation fault".yellow().bold(),
                    component,
                    details
                ),
                _ => {}
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// server
// ─────────────────────────────────────────────────────────────────────────────

fn run_server(
    runtime: &Runtime,
    cfg: &Config,
    manual: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let server = Server::new(&cfg.server, &cfg.link).map_err(|e| e.to_string())?;

    if manual {
        {
            let _rt = runtime.enter();
            server.start(None).map_err(|e| e.to_string())?;
        }
        println!("  Listening on {} (manual control)", cfg.server.listen_addr.bold());
        repl::run(&server, &shutdown);
        runtime.block_on(server.stop());
        return Ok(());
    }

    // Blocking HTTP; must run outside the async runtime.
    print!("  Probing vision server at {} ... ", cfg.vision.base_url.dimmed());
    match probe::probe(&cfg.vision.base_url, &cfg.vision.model) {
        ProbeResult::Ready { models } => {
            println!("{} ({} model(s), {} present)", "online".green(), models, cfg.vision.model.bold())
        }
        ProbeResult::ModelMissing { available } => {
            println!("{}", "online".green());
            println!(
                "  {} model {} not found; available: {}",
                "warning:".yellow(),
                cfg.vision.model.bold(),
                available.join(", ")
            );
        }
        ProbeResult::Unreachable(reason) => {
            println!("{}", "offline".yellow());
            println!("  {}", reason.dimmed());
        }
    }

    let engine: Arc<dyn DecisionEngine> = Arc::new(VisionDriver::from_config(&cfg.vision));
    println!(
        "  Listening on {}  goal: {}",
        cfg.server.listen_addr.bold(),
        cfg.server.goal.italic()
    );

    runtime.block_on(async {
        server.start(Some(engine)).map_err(|e| e.to_string())?;
        wait_for_shutdown(shutdown).await;
        server.stop().await;

        let stats = server.stats();
        println!(
            "  decisions {}, faults {}, commands sent {}",
            stats.decisions.decisions, stats.decisions.faults, stats.link.sent
        );
        Ok(())
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_config(cfg: &Config, path: &std::path::Path, init: bool) -> ExitCode {
    if init {
        if path.exists() {
            println!("  {} already exists; leaving it alone.", path.display().to_string().bold());
            return ExitCode::SUCCESS;
        }
        return match config::save_to(&Config::default(), path) {
            Ok(()) => {
                println!(
                    "  {} defaults written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    let mut shown = cfg.clone();
    if !shown.vision.api_key.is_empty() {
        shown.vision.api_key = "<redacted>".to_string();
    }
    println!("# effective configuration ({})", path.display());
    match toml::to_string_pretty(&shown) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn print_banner() {
    println!();
    println!("  {} {}", "carlink".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  car <-> server streaming link");
    println!();
}
