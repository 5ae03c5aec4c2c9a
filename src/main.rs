//! Sandcastle CLI
//!
//! Clones the current directory into a copy-on-write sandbox, runs a shell in
//! a container over the clone, and compares the sandbox with the host repo.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sandcastle::{
    CliRuntime, ContainerRuntime, GitCompare, LogOptions, Registry, Result, SandConfig, Sandbox,
    SandboxId, Validate, WaitOutcome,
};

/// Exit code reported when a wait was cut short by a deadline.
const DEADLINE_EXIT_CODE: u8 = 124;

/// Sandcastle - run a shell in a disposable clone of the current directory
///
/// Without a subcommand a new sandbox is cloned from the working directory
/// (or an existing one re-entered with `--attach`), its container is started
/// and an interactive shell is opened. The container is always stopped when
/// the shell exits; `--rm` also deletes the container and the clone.
#[derive(Parser, Debug)]
#[command(name = "sandcastle")]
#[command(version)]
struct Cli {
    /// Root directory holding `boxen/<id>/app` clones
    #[arg(long, env = "SANDCASTLE_ROOT", global = true)]
    sandboxen: Option<PathBuf>,

    /// Configuration file (defaults to `<sandboxen>/config.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Container image to run
    #[arg(long, global = true)]
    image: Option<String>,

    /// Dockerfile to build the container image from
    #[arg(long, global = true)]
    dockerfile: Option<PathBuf>,

    /// Shell started inside the container
    #[arg(long, global = true)]
    shell: Option<String>,

    /// CPU limit for the container
    #[arg(long, global = true)]
    cpus: Option<u32>,

    /// Memory limit for the container (e.g. 4G)
    #[arg(long, global = true)]
    memory: Option<String>,

    /// Container CLI to drive (`container`, `docker`, `podman`)
    #[arg(long, global = true)]
    container_cli: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    debug: bool,

    /// Re-enter an existing sandbox instead of creating one
    #[arg(long, conflicts_with = "id")]
    attach: Option<SandboxId>,

    /// Name for the new sandbox (generated when omitted)
    #[arg(long)]
    id: Option<SandboxId>,

    /// Delete the container and clone when the shell exits
    #[arg(long)]
    rm: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show `git status` of a sandbox clone
    Status { id: SandboxId },

    /// Show `git log` of a sandbox clone
    Log { id: SandboxId },

    /// Diff a sandbox against the host repository's HEAD
    Diff {
        /// Include staged, unstaged and untracked changes in the clone
        #[arg(long, short = 'u')]
        include_uncommitted: bool,

        /// Sandbox branch to compare (defaults to the sandbox ID)
        #[arg(long, short = 'b')]
        branch: Option<String>,

        id: SandboxId,
    },

    /// List sandboxes
    #[command(alias = "list")]
    Ls,

    /// Delete a sandbox, its container and its remotes
    Rm { id: SandboxId },

    /// Print a sandbox container's logs
    Logs {
        /// Keep streaming new output
        #[arg(long, short = 'f')]
        follow: bool,

        /// Show the boot log instead of stdio
        #[arg(long)]
        boot: bool,

        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        id: SandboxId,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    initialize_logging(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn initialize_logging(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Builds the configuration: file values first, then command-line overrides.
fn load_config(cli: &Cli) -> Result<SandConfig> {
    let mut config = match (&cli.config, &cli.sandboxen) {
        (Some(path), _) => SandConfig::load(path)?,
        (None, Some(root)) => SandConfig::load_from_root(&absolute(root)?)?,
        (None, None) => SandConfig::load_from_root(&SandConfig::default().clone_root)?,
    };

    if let Some(root) = &cli.sandboxen {
        config.clone_root = absolute(root)?;
    }
    if let Some(image) = &cli.image {
        config = config.with_image(image);
    }
    if let Some(dockerfile) = &cli.dockerfile {
        config = config.with_dockerfile(absolute(dockerfile)?);
    }
    if let Some(shell) = &cli.shell {
        config = config.with_shell(shell);
    }
    if let Some(cli_binary) = &cli.container_cli {
        config.container_cli = cli_binary.clone();
    }
    if cli.cpus.is_some() {
        config.cpus = cli.cpus;
    }
    if cli.memory.is_some() {
        config.memory = cli.memory.clone();
    }

    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "configuration warning");
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let cli_runtime = CliRuntime::new(config.container_cli.clone());
    tracing::debug!(runtime = %cli_runtime.binary(), clone_root = ?config.clone_root, "using container runtime");
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(cli_runtime);
    let registry = Arc::new(Registry::new(config, runtime));

    let Some(command) = cli.command else {
        return session(&registry, cli.attach, cli.id, cli.rm).await;
    };

    match command {
        Command::Status { id } => {
            print!("{}", GitCompare::new(registry).status(&id)?);
        }
        Command::Log { id } => {
            print!("{}", GitCompare::new(registry).log(&id)?);
        }
        Command::Diff {
            include_uncommitted,
            branch,
            id,
        } => {
            let diff = GitCompare::new(registry).diff(&id, branch.as_deref(), include_uncommitted)?;
            print!("{}", diff);
        }
        Command::Ls => {
            for id in registry.list()? {
                match registry.lookup(&id) {
                    Ok(sandbox) => println!(
                        "{}\t{}\t{}",
                        id,
                        sandbox.state,
                        sandbox.host_path().display()
                    ),
                    Err(e) => {
                        tracing::debug!(sandbox_id = %id, error = %e, "unreadable sandbox");
                        println!("{}", id);
                    }
                }
            }
        }
        Command::Rm { id } => {
            registry.remove_sandbox(&id).await?;
            println!("removed {}", id);
        }
        Command::Logs {
            follow,
            boot,
            timeout,
            id,
        } => {
            return logs(&registry, &id, LogOptions { follow, boot }, timeout).await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Creates or re-enters a sandbox, runs the shell, then cleans up.
async fn session(
    registry: &Registry,
    attach: Option<SandboxId>,
    id: Option<SandboxId>,
    remove: bool,
) -> Result<ExitCode> {
    let mut sandbox = match attach {
        Some(id) => registry.attach_sandbox(&id).await?,
        None => registry.new_sandbox(&std::env::current_dir()?, id)?,
    };
    eprintln!(
        "sandbox {} ({}) cloned from {}",
        sandbox.id,
        sandbox.clone_path().display(),
        sandbox.host_path().display()
    );

    // Ctrl-C belongs to the shell; keep this process alive so cleanup runs.
    let interrupts = tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received during shell session");
        }
    });

    let outcome = shell(registry, &mut sandbox).await;
    interrupts.abort();

    let cleanup = registry.cleanup(&mut sandbox, remove).await;
    let outcome = outcome?;
    cleanup?;

    if !remove {
        eprintln!("re-enter with: sandcastle --attach {}", sandbox.id);
    }
    Ok(exit_code(outcome))
}

async fn shell(registry: &Registry, sandbox: &mut Sandbox) -> Result<WaitOutcome> {
    registry.create_container(sandbox).await?;
    registry.start_container(sandbox).await?;
    registry.shell_exec(sandbox, CancellationToken::new()).await
}

async fn logs(
    registry: &Registry,
    id: &SandboxId,
    options: LogOptions,
    timeout: Option<u64>,
) -> Result<ExitCode> {
    let sandbox = registry.attach_sandbox(id).await?;
    let cancel = CancellationToken::new();
    let stream = registry
        .stream_logs(&sandbox, options, cancel.clone())
        .await?;
    let mut lines = stream.lines;

    let deadline = async {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            _ = &mut deadline => {
                cancel.cancel();
                break;
            }
            _ = &mut interrupt => {
                cancel.cancel();
                break;
            }
        }
    }

    let outcome = stream.process.wait().await?;
    if outcome == WaitOutcome::DeadlineExceeded {
        tracing::info!(sandbox_id = %id, "stopped reading logs: deadline exceeded");
        return Ok(ExitCode::SUCCESS);
    }
    Ok(exit_code(outcome))
}

fn exit_status(outcome: WaitOutcome) -> u8 {
    match outcome {
        WaitOutcome::Exited(Some(code)) => u8::try_from(code).unwrap_or(1),
        WaitOutcome::Exited(None) | WaitOutcome::Abandoned => 1,
        WaitOutcome::DeadlineExceeded => DEADLINE_EXIT_CODE,
    }
}

fn exit_code(outcome: WaitOutcome) -> ExitCode {
    ExitCode::from(exit_status(outcome))
}
