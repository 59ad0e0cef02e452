use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use fanout::config::Config;
use fanout::core::OrchestrationStatus;
use fanout::orchestration::{DevRequest, OrchestrationService, TaskPlan};
use fanout::{http, Error, Result};

/// fanout - run a development request as parallel subagent tasks
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FANOUT_DEBUG=1  Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.fanout/fanout.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve the REST and event stream API
    Serve {
        /// Listen address (overrides bind_addr)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Do not load persisted orchestrations on startup
        #[arg(long)]
        no_restore: bool,
    },

    /// Run one request to completion, printing events as JSON lines
    Run(RunArgs),

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// What to build
    pub description: String,

    /// Task plan (.toml or .json). Without one the default template is used
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Request id (random if omitted)
    #[arg(long)]
    pub request_id: Option<String>,

    /// Concurrency limit for this run
    #[arg(short = 'j', long)]
    pub max_concurrency: Option<usize>,

    /// Auto-resolve every conflict once the run finishes
    #[arg(long)]
    pub auto_resolve: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    fanout::log::init_with_debug(cli.debug, config.log_file().as_deref());

    match cli.command {
        Command::Serve { bind, no_restore } => run_server(config, bind, no_restore),
        Command::Run(args) => {
            if !run_request(config, args)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Init { force } => run_init(&config, cli.config, force),
    }
}

fn run_server(config: Config, bind: Option<SocketAddr>, no_restore: bool) -> Result<()> {
    let addr = match bind {
        Some(addr) => addr,
        None => config
            .bind_addr
            .parse()
            .map_err(|e| Error::Validation(format!("invalid bind_addr '{}': {}", config.bind_addr, e)))?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let service = OrchestrationService::from_config(&config);
        if !no_restore {
            service.restore().await?;
        }
        http::serve(service, addr).await
    })
}

/// Returns whether the orchestration completed.
fn run_request(config: Config, args: RunArgs) -> Result<bool> {
    let request_id = args
        .request_id
        .unwrap_or_else(|| format!("cli-{}", &uuid::Uuid::new_v4().to_string()[..8]));
    let request = DevRequest::new(request_id, &args.description);
    let plan = args.plan.as_deref().map(TaskPlan::load).transpose()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let service = OrchestrationService::from_config(&config);
        let (handle, mut events) = match plan {
            Some(plan) => {
                service
                    .start_with_plan(request, plan, args.max_concurrency)
                    .await?
            }
            None => {
                service
                    .start_orchestration(request, args.max_concurrency)
                    .await?
            }
        };
        info!(orchestration_id = %handle.id(), request_id = %handle.request_id(), "running");

        let mut interrupted = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => println!("{}", serde_json::to_string(&event)?),
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    warn!("interrupted, cancelling");
                    handle.cancel().await;
                }
            }
        }

        if args.auto_resolve {
            for conflict in handle.conflicts().await.into_iter().filter(|c| !c.is_resolved()) {
                let resolved = handle.resolve_conflict(conflict.id, true).await?;
                println!("{}", serde_json::to_string(&resolved)?);
            }
        }

        let summary = handle.summary().await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok::<_, Error>(summary.orchestration.status == OrchestrationStatus::Completed)
    })
}

fn run_init(config: &Config, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => Config::config_path()?,
    };
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config.save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
