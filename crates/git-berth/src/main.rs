//! CLI entry point for git-berth.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use git_berth_core::RepoNotification;
use git_berth_session::{RepoSession, SessionConfig};

/// Serialized sessions over one Git repository.
#[derive(Parser, Debug)]
#[command(
    name = "git-berth",
    version,
    about = "git-berth: watch and drive a Git repository through a serialized session"
)]
struct Cli {
    /// Path to repo or any subdir (defaults to current).
    #[arg(long)]
    repo: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream repository change notifications until interrupted.
    Watch {
        /// Emit JSON lines instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Coalescing window in milliseconds, replacing the configured one.
        #[arg(long)]
        window_ms: Option<u64>,
    },

    /// Print every reference and the commit it resolves to.
    Refs,

    /// Print the current HEAD name and target.
    Head,

    /// Print a commit's position in the history walked from HEAD.
    Position {
        /// Commit id (full hex).
        commit: String,
    },

    /// Create a branch and wait for the session to settle.
    Branch {
        /// Branch name without the refs/heads/ prefix.
        name: String,
        /// Commit id to branch from (defaults to HEAD).
        #[arg(long)]
        at: Option<String>,
    },
}

fn main() -> Result<()> {
    let Cli { repo, cmd } = Cli::parse();

    if should_install_tracing(&cmd) {
        install_tracing();
    }

    let repo_path = repo.unwrap_or_else(|| ".".to_owned());
    execute_command(&repo_path, cmd)
}

fn execute_command(repo_path: &str, command: Command) -> Result<()> {
    match command {
        Command::Watch { json, window_ms } => {
            let session = match window_ms {
                Some(ms) => {
                    let config =
                        SessionConfig::default().with_coalesce_window(Duration::from_millis(ms));
                    RepoSession::open_with(repo_path, &config)?
                }
                None => RepoSession::open(repo_path)?,
            };
            watch_loop(&session, json)
        }

        Command::Refs => {
            let session = RepoSession::open(repo_path)?;
            for (name, target) in session.refs()? {
                println!("{target} {name}");
            }
            Ok(())
        }

        Command::Head => {
            let session = RepoSession::open(repo_path)?;
            let name = session
                .head_name()?
                .unwrap_or_else(|| "(no HEAD)".to_owned());
            match session.head_target()? {
                Some(target) => println!("{name} {target}"),
                None => println!("{name} (unborn)"),
            }
            Ok(())
        }

        Command::Position { commit } => {
            let session = RepoSession::open(repo_path)?;
            let Some(position) = session.position_of_commit(&commit)? else {
                bail!("commit {commit} is not reachable from HEAD");
            };
            let summary = session.commit_summary(&commit)?;
            println!("{position}\t{summary}");
            Ok(())
        }

        Command::Branch { name, at } => {
            let session = RepoSession::open(repo_path)?;
            let refname = session.create_branch(&name, at.as_deref())?;
            session.wait();
            println!("{refname}");
            Ok(())
        }
    }
}

fn watch_loop(session: &RepoSession, json: bool) -> Result<()> {
    let mut notifications = session.subscribe();
    loop {
        match notifications.blocking_recv() {
            Ok(notification) => print_notification(&notification, json)?,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "notification stream lagged; treat everything as changed");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn print_notification(notification: &RepoNotification, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(notification)?);
    } else {
        println!("{notification}");
    }
    Ok(())
}

const fn should_install_tracing(cmd: &Command) -> bool {
    // JSON watch output is machine-read from stdout; keep logs out of it.
    !matches!(cmd, Command::Watch { json: true, .. })
}

fn install_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_watch_command() {
        let cli = Cli::parse_from([
            "git-berth",
            "--repo",
            ".",
            "watch",
            "--json",
            "--window-ms",
            "250",
        ]);

        assert_eq!(cli.repo.as_deref(), Some("."));
        match cli.cmd {
            Command::Watch { json, window_ms } => {
                assert!(json);
                assert_eq!(window_ms, Some(250));
            }
            _ => panic!("expected watch command"),
        }
    }

    #[test]
    fn parse_position_command() {
        let cli = Cli::parse_from(["git-berth", "position", "0123abc"]);

        match cli.cmd {
            Command::Position { commit } => assert_eq!(commit, "0123abc"),
            _ => panic!("expected position command"),
        }
    }

    #[test]
    fn parse_branch_command() {
        let cli = Cli::parse_from(["git-berth", "branch", "topic", "--at", "0123abc"]);

        match cli.cmd {
            Command::Branch { name, at } => {
                assert_eq!(name, "topic");
                assert_eq!(at.as_deref(), Some("0123abc"));
            }
            _ => panic!("expected branch command"),
        }
    }

    #[test]
    fn tracing_stays_out_of_json_watch_output() {
        assert!(!should_install_tracing(&Command::Watch {
            json: true,
            window_ms: None
        }));
        assert!(should_install_tracing(&Command::Watch {
            json: false,
            window_ms: None
        }));
        assert!(should_install_tracing(&Command::Refs));
    }
}
