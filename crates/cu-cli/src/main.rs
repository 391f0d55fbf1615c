//! container-use CLI
//!
//! The `container-use` command runs development commands inside throwaway
//! containers and records every resulting filesystem state as a commit on the
//! environment's own git branch.
//!
//! ## Commands
//!
//! - `create`: Build a new environment from committed history
//! - `exec`: Run a command in an environment and persist the result
//! - `list`: Show environments in this repository
//! - `delete`: Remove an environment branch and retire its id
//! - `status`: Report whether the host worktree has uncommitted changes

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cu_core::{
    CreateRequest, CuError, Environment, PersistOutcome, Registry, RunRequest, DEFAULT_SHELL,
};
use cu_engine::{ContainerEngine, DockerEngine, EngineSession, ENGINE_ENV};
use cu_state::GitRepository;
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "container-use")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Git-backed containerized development environments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Docker-compatible engine binary (docker, podman, ...)
    #[arg(long, global = true, env = ENGINE_ENV, default_value = "docker")]
    engine: String,

    /// Repository to operate on
    #[arg(short = 'C', long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new environment from a committed reference
    Create {
        /// Environment title
        #[arg(value_name = "TITLE")]
        title_arg: Option<String>,

        /// Environment title (overrides the positional title)
        #[arg(long)]
        title: Option<String>,

        /// Longer description stored with the environment
        #[arg(short, long, default_value = "")]
        description: String,

        /// Commit, branch or tag to build from
        #[arg(long, default_value = "HEAD")]
        from_ref: String,

        /// Print machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Run a command in an environment and persist the result
    Exec {
        /// Environment id
        id: String,

        /// Command line to run
        command: String,

        /// Shell used to interpret the command
        #[arg(long, default_value = DEFAULT_SHELL)]
        shell: String,

        /// Pass the command to the image entrypoint instead of a shell
        #[arg(long)]
        use_entrypoint: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Commit subject to use instead of the command summary
        #[arg(short, long)]
        note: Option<String>,

        /// Print machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// List environments
    List {
        /// Print machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Delete an environment
    Delete {
        /// Environment id
        id: String,
    },

    /// Show whether the host worktree has uncommitted changes
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cu_core::init_tracing(cli.log_json, level);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(hint) = remediation(&err) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let engine = DockerEngine::new(&cli.engine);
    match cli.command {
        Commands::Create {
            title_arg,
            title,
            description,
            from_ref,
            json,
        } => {
            let (registry, session) = open_with_engine(&cli.repo, &engine).await?;
            let request = CreateRequest {
                title: title.or(title_arg).unwrap_or_default(),
                description,
                from_ref: Some(from_ref),
            };
            cmd_create(&registry, session.as_ref(), request, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec {
            id,
            command,
            shell,
            use_entrypoint,
            timeout,
            note,
            json,
        } => {
            let (registry, session) = open_with_engine(&cli.repo, &engine).await?;
            let mut request = RunRequest::new(command)
                .with_shell(shell)
                .with_entrypoint(use_entrypoint);
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            let code = cmd_exec(&registry, session.as_ref(), &id, &request, note.as_deref(), json).await?;
            Ok(ExitCode::from(exit_status(code)))
        }
        Commands::List { json } => {
            let registry = open_registry(&cli.repo).await?;
            cmd_list(&registry, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { id } => {
            let registry = open_registry(&cli.repo).await?;
            cmd_delete(&registry, &id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let registry = open_registry(&cli.repo).await?;
            cmd_status(&registry).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_registry(repo: &Path) -> Result<Registry> {
    let store = GitRepository::open(repo)
        .await
        .map_err(CuError::from)
        .with_context(|| format!("Failed to open repository at {}", repo.display()))?;
    Ok(Registry::new(Arc::new(store)))
}

/// Open the repository and connect to the engine at the same time.
async fn open_with_engine(
    repo: &Path,
    engine: &DockerEngine,
) -> Result<(Registry, Box<dyn EngineSession>)> {
    let (registry, session) = tokio::try_join!(open_registry(repo), async {
        engine
            .connect()
            .await
            .map_err(CuError::from)
            .with_context(|| format!("Failed to connect to {}", engine.name()))
    })?;
    debug!(engine = engine.name(), "engine session ready");
    Ok((registry, session))
}

/// The first domain error's hint anywhere in the chain.
fn remediation(err: &anyhow::Error) -> Option<&'static str> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CuError>())
        .and_then(CuError::remediation)
}

/// Map a command's exit code onto the process exit status.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[derive(Serialize)]
struct CreatedJson<'a> {
    id: &'a str,
    title: &'a str,
    branch: &'a str,
    head_commit: &'a str,
    config: &'a cu_core::EnvironmentConfig,
    worktree_dirty: bool,
}

/// Create a new environment
async fn cmd_create(
    registry: &Registry,
    session: &dyn EngineSession,
    request: CreateRequest,
    json: bool,
) -> Result<()> {
    let from_ref = request.from_ref.clone().unwrap_or_else(|| "HEAD".to_string());
    let env = registry
        .create(session, request)
        .await
        .with_context(|| format!("Failed to create environment from '{from_ref}'"))?;
    let (dirty, status_text) = registry.is_dirty().await?;

    if json {
        let out = CreatedJson {
            id: env.id().as_str(),
            title: env.title(),
            branch: env.branch_ref(),
            head_commit: env.head_commit().as_str(),
            config: env.config(),
            worktree_dirty: dirty,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_created(&env);
    if dirty {
        eprintln!();
        eprintln!("warning: the host worktree has uncommitted changes; they are not part of this environment:");
        for line in status_text.lines() {
            eprintln!("  {line}");
        }
    }
    Ok(())
}

fn print_created(env: &Environment) {
    let config = env.config();
    println!("Created environment {} ({})", env.id(), env.title());
    println!("  branch:  {}", env.branch_ref());
    println!("  commit:  {}", env.head_commit().short());
    println!("  image:   {}", config.base_image);
    println!("  workdir: {}", config.workdir);
    let commands: Vec<&str> = config.build_commands().collect();
    if !commands.is_empty() {
        println!("  build:");
        for command in commands {
            println!("    {command}");
        }
    }
    println!();
    println!("Next steps:");
    println!("  container-use exec {} '<command>'", env.id());
    println!("  git log {}", env.branch_ref());
}

#[derive(Serialize)]
struct ExecJson<'a> {
    id: &'a str,
    command: &'a str,
    exit_code: i32,
    stdout: &'a str,
    stderr: &'a str,
    duration_ms: u64,
    persisted: Option<PersistOutcome>,
    persist_error: Option<String>,
}

/// Run one command and persist what it left behind. Returns the command's
/// exit code.
async fn cmd_exec(
    registry: &Registry,
    session: &dyn EngineSession,
    id: &str,
    request: &RunRequest,
    note: Option<&str>,
    json: bool,
) -> Result<i32> {
    let mut env = registry
        .get(id)
        .await
        .with_context(|| format!("Failed to open environment '{id}'"))?;

    let result = tokio::select! {
        res = env.run(registry.snapshots(), session, request) => {
            res.with_context(|| format!("Failed to run command in '{id}'"))?
        }
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("interrupted; the container was removed and nothing was persisted");
        }
    };

    let persisted = tokio::select! {
        res = registry.persist(&mut env, note) => res.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted while persisting")),
    };

    if json {
        let (outcome, persist_error) = match &persisted {
            Ok(outcome) => (Some(outcome.clone()), None),
            Err(err) => (None, Some(format!("{err:#}"))),
        };
        let out = ExecJson {
            id: env.id().as_str(),
            command: &result.command,
            exit_code: result.exit_code,
            stdout: &result.stdout,
            stderr: &result.stderr,
            duration_ms: result.duration.as_millis() as u64,
            persisted: outcome,
            persist_error,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_output(&result.stdout, &result.stderr);
        match &persisted {
            Ok(PersistOutcome::Committed { commit, .. }) => {
                eprintln!("Saved to {} at {}", env.branch_ref(), commit.short());
            }
            Ok(PersistOutcome::Unchanged) => eprintln!("No changes to save"),
            Err(_) => {}
        }
    }

    if let Err(err) = persisted {
        eprintln!("warning: changes were not persisted: {err:#}");
        if let Some(hint) = remediation(&err) {
            eprintln!("hint: {hint}");
        }
        if result.success() {
            return Ok(1);
        }
    }
    Ok(result.exit_code)
}

fn print_output(stdout: &str, stderr: &str) {
    if !stdout.is_empty() {
        print!("{stdout}");
        if !stdout.ends_with('\n') {
            println!();
        }
    }
    for line in stderr.lines() {
        println!("stderr: {line}");
    }
}

/// List environments
async fn cmd_list(registry: &Registry, json: bool) -> Result<()> {
    let environments = registry.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&environments)?);
        return Ok(());
    }
    if environments.is_empty() {
        println!("No environments found. Run 'container-use create' first.");
        return Ok(());
    }
    for env in environments {
        println!(
            "{:<28} {} {}  {}",
            env.id.as_str(),
            env.head_commit.short(),
            env.updated_at.format("%Y-%m-%d %H:%M"),
            env.title
        );
    }
    Ok(())
}

/// Delete an environment
async fn cmd_delete(registry: &Registry, id: &str) -> Result<()> {
    registry
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete environment '{id}'"))?;
    println!("Deleted environment '{id}'");
    Ok(())
}

/// Report host worktree state
async fn cmd_status(registry: &Registry) -> Result<()> {
    let (dirty, status_text) = registry.is_dirty().await?;
    if dirty {
        println!("Worktree has uncommitted changes (not visible to new environments):");
        for line in status_text.lines() {
            println!("  {line}");
        }
    } else {
        println!("Worktree clean");
    }
    Ok(())
}
