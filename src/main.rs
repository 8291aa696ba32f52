use std::path::PathBuf;
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `tofu-broker tf dump .. | less`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tofu_broker::broker::purge;
use tofu_broker::brokerpak::packer::{self, BuildOptions};
use tofu_broker::brokerpak::BrokerpakReader;
use tofu_broker::config::Config;
use tofu_broker::executor::ProcessRunner;
use tofu_broker::output::formatter;
use tofu_broker::server::state::Credentials;
use tofu_broker::server::{self, AppState};
use tofu_broker::startup;

/// tofu-broker - Open Service Broker backed by OpenTofu brokerpaks
#[derive(Parser)]
#[command(name = "tofu-broker", version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OSBAPI server
    Serve,

    /// Build, inspect and validate brokerpaks
    Pak {
        #[command(subcommand)]
        command: PakCommands,
    },

    /// Remove a service instance and its bindings from the database without running tofu
    Purge {
        /// Service instance GUID
        instance: String,
    },

    /// Remove a service binding from the database without running tofu
    PurgeBinding {
        /// Service instance GUID
        instance: String,
        /// Service binding GUID
        binding: String,
    },

    /// Inspect stored deployments
    Tf {
        #[command(subcommand)]
        command: TfCommands,
    },
}

#[derive(Subcommand)]
enum PakCommands {
    /// Write a skeleton manifest and service definition
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Download binaries and package a directory into a .brokerpak
    Build {
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Directory the archive is written to
        #[arg(short, long)]
        target_dir: Option<PathBuf>,

        /// Download cache; falls back to BROKERPAK_CACHE_PATH
        #[arg(long)]
        cache_path: Option<PathBuf>,

        /// Also package each binary's source archive
        #[arg(long)]
        include_source: bool,
    },

    /// Check a built pak for consistency
    Validate { pak: PathBuf },

    /// Print the manifest, catalog and contents of a pak
    Info { pak: PathBuf },

    /// Render the offerings of a pak as markdown
    Docs { pak: PathBuf },
}

#[derive(Subcommand)]
enum TfCommands {
    /// Show one deployment's status and workspace
    Dump {
        /// Deployment id, e.g. tf:<instance>:<binding>
        id: String,
    },

    /// List every stored deployment
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if matches!(cli.command, Commands::Serve) {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve => cmd_serve().await,
        Commands::Pak { command } => cmd_pak(command).await,
        Commands::Purge { ref instance } => cmd_purge(instance),
        Commands::PurgeBinding {
            ref instance,
            ref binding,
        } => cmd_purge_binding(instance, binding),
        Commands::Tf { command } => cmd_tf(command),
    };

    if let Err(e) = &result {
        formatter::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_serve() -> Result<()> {
    let config = Config::from_env()?;
    let core = startup::start(&config, Arc::new(ProcessRunner::new())).await?;

    let credentials = Credentials {
        username: config.username.clone(),
        password: config.password.clone(),
    };
    if !credentials.enabled() {
        tracing::warn!("basic auth disabled: SECURITY_USER_NAME and SECURITY_USER_PASSWORD are empty");
    }
    let state = AppState::new(core.broker.clone(), credentials);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let served = server::serve(state, config.port, shutdown).await;
    core.shutdown().await;
    served
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown requested");
    shutdown.cancel();
}

async fn cmd_pak(command: PakCommands) -> Result<()> {
    match command {
        PakCommands::Init { dir } => {
            packer::init(&dir)?;
            formatter::print_success(&format!("Initialized brokerpak skeleton in {}", dir.display()));
        }
        PakCommands::Build {
            dir,
            target_dir,
            cache_path,
            include_source,
        } => {
            let cache_path = cache_path.or_else(|| std::env::var_os("BROKERPAK_CACHE_PATH").map(PathBuf::from));
            let opts = BuildOptions {
                cache_path,
                include_source,
                output_dir: target_dir,
            };
            let path = packer::build(&dir, &opts).await?;
            formatter::print_success(&format!("Built {}", path.display()));
        }
        PakCommands::Validate { pak } => {
            BrokerpakReader::open(&pak)?
                .validate()
                .with_context(|| format!("{} is invalid", pak.display()))?;
            formatter::print_success(&format!("{} is valid", pak.display()));
        }
        PakCommands::Info { pak } => {
            let mut reader = BrokerpakReader::open(&pak)?;
            let manifest = reader.manifest()?;
            let services = reader.services()?;
            let entries = reader.entries()?;
            formatter::print_pak_info(&manifest, &services, &entries);
        }
        PakCommands::Docs { pak } => {
            let services = BrokerpakReader::open(&pak)?.services()?;
            print!("{}", tofu_broker::brokerpak::docs::render(&services));
        }
    }
    Ok(())
}

fn cmd_purge(instance: &str) -> Result<()> {
    let storage = startup::open_storage(&Config::from_env()?)?;
    purge::purge_instance(&storage, instance)?;
    formatter::print_success(&format!("Purged service instance {instance}"));
    Ok(())
}

fn cmd_purge_binding(instance: &str, binding: &str) -> Result<()> {
    let storage = startup::open_storage(&Config::from_env()?)?;
    purge::purge_binding(&storage, instance, binding)?;
    formatter::print_success(&format!("Purged binding {binding} of service instance {instance}"));
    Ok(())
}

fn cmd_tf(command: TfCommands) -> Result<()> {
    let storage = startup::open_storage(&Config::from_env()?)?;
    match command {
        TfCommands::Dump { id } => {
            let deployment = storage
                .get_terraform_deployment(&id)
                .with_context(|| format!("could not load deployment {id}"))?;
            formatter::print_deployment(&deployment);
        }
        TfCommands::List => {
            let entries = storage.get_all_terraform_deployments()?;
            formatter::print_deployment_list(&entries);
        }
    }
    Ok(())
}
