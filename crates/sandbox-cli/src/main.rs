//! Sandbox CLI - grading sandbox on a remote host
//!
//! Usage:
//!   sandbox init                     Write .sandbox/config.toml
//!   sandbox serve                    Start the HTTP server for the UI
//!   sandbox run <task>               Run an agent task
//!   sandbox exec <command>           Run a command in the working root
//!   sandbox bg <command>             Start a command in a background session
//!   sandbox output                   Show a background session's output
//!   sandbox end                      Stop a background session
//!   sandbox sessions                 List background sessions
//!   sandbox load ...                 Copy a submission into the working root
//!   sandbox history --server <url>   Show a running server's command log

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sandbox_agent::TaskStatus;
use sandbox_core::{markup, CommandHistoryEntry, SandboxConfig};
use sandbox_remote::{
    load_submission, CommandHistory, DirectorySubmissionStore, RemoteSession, SessionRegistry,
    SshConnection, SshTarget, SubmissionKey,
};
use sandbox_server::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sandbox")]
#[command(author, version, about = "Grading sandbox: a remote host, background sessions and an agent")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding `.sandbox/`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter `.sandbox/config.toml`
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Port (overrides the config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run an agent task against the sandbox
    Run {
        /// Task description
        task: String,

        /// Iteration cap (overrides the config)
        #[arg(short = 'n', long)]
        max_iterations: Option<usize>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a command in the working root
    Exec {
        command: String,
    },

    /// Start a command in a background session
    Bg {
        command: String,

        /// Session name (defaults to the configured session)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show the current output of a background session
    Output {
        #[arg(short, long)]
        session: Option<String>,

        /// Strip terminal escape sequences
        #[arg(long, conflicts_with = "html")]
        plain: bool,

        /// Print display markup instead of raw output
        #[arg(long)]
        html: bool,
    },

    /// Stop a background session
    End {
        #[arg(short, long)]
        session: Option<String>,
    },

    /// List background sessions on the host
    Sessions,

    /// Copy a submission into the working root (previous contents are removed)
    Load {
        #[arg(long)]
        term: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        student: String,
    },

    /// Show the command log of a running server
    History {
        /// Server base URL
        #[arg(long, default_value = "http://localhost:7080")]
        server: String,

        /// Only the most recent entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let root = cli.root;
    match cli.command {
        Commands::Init { force } => cmd_init(&root, force),
        Commands::Serve { port } => cmd_serve(&root, port).await,
        Commands::Run {
            task,
            max_iterations,
            json,
        } => cmd_run(&root, task, max_iterations, json).await,
        Commands::Exec { command } => cmd_exec(&root, command).await,
        Commands::Bg { command, session } => cmd_bg(&root, command, session).await,
        Commands::Output {
            session,
            plain,
            html,
        } => cmd_output(&root, session, plain, html).await,
        Commands::End { session } => cmd_end(&root, session).await,
        Commands::Sessions => cmd_sessions(&root).await,
        Commands::Load {
            term,
            course,
            assignment,
            student,
        } => cmd_load(&root, SubmissionKey::new(term, course, assignment, student)).await,
        Commands::History { server, limit } => cmd_history(server, limit).await,
    }
}

fn load_config(root: &Path) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::load_or_default(root).context("Failed to load configuration")?;
    config.apply_env()?;
    Ok(config)
}

/// Remote host access without the model (no API token needed)
fn remote(config: &SandboxConfig) -> Result<(Arc<RemoteSession>, SessionRegistry)> {
    config.validate()?;
    let transport = Arc::new(SshConnection::new(SshTarget::from_config(&config.remote)?));
    let history = Arc::new(CommandHistory::new(config.history.capacity));
    let session = Arc::new(RemoteSession::from_config(transport, &config.remote, history));
    let registry = SessionRegistry::new(
        session.clone(),
        config.remote.default_session.clone(),
        config.remote.capture_lines,
    );
    Ok((session, registry))
}

/// Token cancelled on Ctrl+C
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn close(session: &RemoteSession) {
    if let Err(e) = session.disconnect().await {
        warn!("Failed to close the connection: {}", e);
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(".sandbox/config.toml");
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }

    let path = SandboxConfig::write_default(root)?;
    println!("Wrote {}", path.display());
    println!("Set remote.host (or SANDBOX_HOST) and the model API key before running tasks.");
    Ok(())
}

async fn cmd_serve(root: &Path, port: Option<u16>) -> Result<()> {
    let mut config = load_config(root)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    sandbox_server::run(&config, &root.join(".sandbox")).await
}

async fn cmd_run(root: &Path, task: String, max_iterations: Option<usize>, json: bool) -> Result<()> {
    let mut config = load_config(root)?;
    if let Some(max) = max_iterations {
        config.agent.max_iterations = max;
    }

    let state = AppState::from_config(&config, &root.join(".sandbox"))?;
    let cancel = ctrl_c_token();

    info!("Running task on {}", state.session.describe());
    let outcome = state.agent.run(&task, &cancel).await?;
    close(&state.session).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.summary);
        println!();
        println!(
            "{} after {} iterations ({} turns, {} input / {} output tokens)",
            match outcome.status {
                TaskStatus::Completed => "Completed",
                TaskStatus::Incomplete => "Incomplete",
            },
            outcome.iterations,
            outcome.conversation.len(),
            outcome.usage.input_tokens,
            outcome.usage.output_tokens
        );
    }
    Ok(())
}

async fn cmd_exec(root: &Path, command: String) -> Result<()> {
    let config = load_config(root)?;
    let (session, _) = remote(&config)?;
    let cancel = ctrl_c_token();

    let output = session.run(&command, &cancel).await;
    close(&session).await;
    let output = output?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if let Some(code) = output.exit_code.filter(|code| *code != 0) {
        std::process::exit(code);
    }
    Ok(())
}

async fn cmd_bg(root: &Path, command: String, session_name: Option<String>) -> Result<()> {
    let config = load_config(root)?;
    let (session, registry) = remote(&config)?;
    let name = registry.resolve_name(session_name.as_deref())?;

    let output = registry
        .run_in_background(&name, &command, &CancellationToken::new())
        .await;
    close(&session).await;
    let output = output?;

    println!("Started in session {}", name);
    print!("{}", output.stdout);
    Ok(())
}

async fn cmd_output(root: &Path, session_name: Option<String>, plain: bool, html: bool) -> Result<()> {
    let config = load_config(root)?;
    let (session, registry) = remote(&config)?;
    let name = registry.resolve_name(session_name.as_deref())?;

    let output = registry.read_output(&name, &CancellationToken::new()).await;
    close(&session).await;
    let output = output?;

    let text = if plain {
        markup::strip_escapes(&output.stdout)
    } else if html {
        markup::to_display_markup(&output.stdout)
    } else {
        output.stdout
    };
    print!("{}", text);
    if !text.ends_with('\n') && !text.is_empty() {
        println!();
    }
    Ok(())
}

async fn cmd_end(root: &Path, session_name: Option<String>) -> Result<()> {
    let config = load_config(root)?;
    let (session, registry) = remote(&config)?;
    let name = registry.resolve_name(session_name.as_deref())?;

    let ended = registry.end(&name, &CancellationToken::new()).await;
    close(&session).await;

    if ended? {
        println!("Ended session {}", name);
    } else {
        println!("No session named {}", name);
    }
    Ok(())
}

async fn cmd_sessions(root: &Path) -> Result<()> {
    let config = load_config(root)?;
    let (session, registry) = remote(&config)?;

    let names = registry.list(&CancellationToken::new()).await;
    close(&session).await;
    let names = names?;

    if names.is_empty() {
        println!("No background sessions");
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

async fn cmd_load(root: &Path, key: SubmissionKey) -> Result<()> {
    let config = load_config(root)?;
    let (session, _) = remote(&config)?;
    let store = DirectorySubmissionStore::new(config.submissions.root.clone());
    let cancel = ctrl_c_token();

    let loaded = load_submission(&session, &store, &key, &cancel).await;
    close(&session).await;
    let source = loaded?;

    println!(
        "Loaded {} from {} into {}",
        key,
        source.display(),
        session.working_directory()
    );
    Ok(())
}

async fn cmd_history(server: String, limit: Option<usize>) -> Result<()> {
    let url = format!("{}/api/commands/history", server.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    if !response.status().is_success() {
        bail!("{} returned {}", url, response.status());
    }

    let entries: Vec<CommandHistoryEntry> = response.json().await?;
    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));

    for entry in entries.iter().skip(skip) {
        let location = entry.session.as_deref().unwrap_or(entry.directory.as_str());
        println!(
            "[{}] ({}) $ {}",
            entry.timestamp.format("%H:%M:%S"),
            location,
            entry.command
        );
        let stdout = markup::strip_escapes(&entry.stdout);
        for line in stdout.lines() {
            println!("    {}", line);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_output_flags() {
        let cli = Cli::try_parse_from(["sandbox", "output", "--session", "web", "--plain"]).unwrap();
        match cli.command {
            Commands::Output {
                session,
                plain,
                html,
            } => {
                assert_eq!(session.as_deref(), Some("web"));
                assert!(plain);
                assert!(!html);
            }
            _ => panic!("expected output command"),
        }

        assert!(Cli::try_parse_from(["sandbox", "output", "--plain", "--html"]).is_err());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        cmd_init(temp_dir.path(), false).unwrap();
        assert!(cmd_init(temp_dir.path(), false).is_err());
        cmd_init(temp_dir.path(), true).unwrap();
    }
}
