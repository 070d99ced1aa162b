//! MobileCLI Agent - host daemon relaying coding-assistant sessions to your phone
//!
//! Usage:
//!   mobilecli-agent start          # Start the agent in the background
//!   mobilecli-agent status         # Show the agent and its live sessions
//!   mobilecli-agent attach [name]  # Watch a live session (like screen -x)
//!   mobilecli-agent history        # Recently ended sessions
//!   mobilecli-agent stop           # Stop the agent
//!   mobilecli-agent daemon         # Run the agent in the foreground

mod agent;
mod attach;
mod auth;
mod bridge;
mod config;
mod daemon;
mod e2e;
mod history;
mod local;
mod platform;
mod protocol;
mod registry;
mod supervisor;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mobilecli-agent")]
#[command(author = "bigphoot")]
#[command(version)]
#[command(about = "Relay coding-assistant sessions on this host to your phone", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the agent config file
#[derive(Debug, Clone, Default, clap::Args)]
struct DaemonArgs {
    /// Local port for CLI connections
    #[arg(short, long)]
    port: Option<u16>,

    /// Bridge WebSocket URL
    #[arg(long)]
    bridge_url: Option<String>,

    /// Host name shown in the mobile app
    #[arg(long)]
    host_name: Option<String>,
}

impl DaemonArgs {
    fn to_options(&self) -> daemon::DaemonOptions {
        daemon::DaemonOptions {
            port: self.port,
            bridge_url: self.bridge_url.clone(),
            host_name: self.host_name.clone(),
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.extend(["--port".to_string(), port.to_string()]);
        }
        if let Some(url) = &self.bridge_url {
            args.extend(["--bridge-url".to_string(), url.clone()]);
        }
        if let Some(host) = &self.host_name {
            args.extend(["--host-name".to_string(), host.clone()]);
        }
        args
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Daemon {
        #[command(flatten)]
        args: DaemonArgs,
    },
    /// Start the agent in the background
    Start {
        #[command(flatten)]
        args: DaemonArgs,
    },
    /// Show the agent and its live sessions
    Status,
    /// Stop the background agent
    Stop,
    /// Watch a live session (like screen -x or tmux attach)
    Attach {
        /// Session ID prefix or name (shows a picker if omitted)
        session: Option<String>,
    },
    /// Show recently ended sessions that can be resumed
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = match "mobilecli_agent=info".parse::<tracing_subscriber::filter::Directive>() {
        Ok(directive) => tracing_subscriber::EnvFilter::from_default_env().add_directive(directive),
        Err(_) => tracing_subscriber::EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { args } => {
            if daemon::is_running() {
                eprintln!("{}", "Agent is already running".yellow());
                return ExitCode::FAILURE;
            }
            match daemon::run(args.to_options()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}: {}", "Agent error".red().bold(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Start { args } => {
            if daemon::is_running() {
                println!("{}", "Agent is already running".dimmed());
                return ExitCode::SUCCESS;
            }
            match start_daemon_background(&args).await {
                Ok(()) => {
                    println!("{} Agent started", "✓".green());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", "Failed to start agent".red().bold(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Status => {
            show_status().await;
            ExitCode::SUCCESS
        }
        Commands::Stop => {
            stop_daemon();
            ExitCode::SUCCESS
        }
        Commands::Attach { session } => match attach::run(session).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}: {}", "Attach error".red().bold(), e);
                ExitCode::FAILURE
            }
        },
        Commands::History => {
            show_history();
            ExitCode::SUCCESS
        }
    }
}

/// Start the agent in background
async fn start_daemon_background(args: &DaemonArgs) -> std::io::Result<()> {
    #[cfg(unix)]
    use nix::unistd::setsid;
    #[cfg(unix)]
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    let exe = std::env::current_exe()?;

    let log_dir = platform::config_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("agent.log");
    let log_file = std::fs::File::create(&log_path)?;

    let mut cmd = Command::new(&exe);
    cmd.arg("daemon")
        .args(args.to_cli_args())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::from(log_file));

    // Detach from the controlling terminal so the agent survives it
    #[cfg(unix)]
    {
        // SAFETY: setsid() is async-signal-safe
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        const DETACHED_PROCESS: u32 = 0x00000008;
        cmd.creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS);
    }

    cmd.spawn()?;

    let mut delay_ms = 100;
    for _ in 0..6 {
        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        if daemon::is_running() {
            return Ok(());
        }
        delay_ms = (delay_ms * 2).min(1000);
    }

    Err(std::io::Error::other(format!(
        "Agent failed to start (check {})",
        log_path.display()
    )))
}

fn stop_daemon() {
    match daemon::get_pid().filter(|pid| platform::is_process_alive(*pid)) {
        Some(pid) => {
            if platform::terminate_process(pid) {
                println!("{} Agent stopped", "✓".green());
            } else {
                println!("{}", "Failed to stop agent".red());
            }
        }
        None => println!("{}", "Agent is not running".dimmed()),
    }
}

async fn show_status() {
    let Some(pid) = daemon::get_pid().filter(|pid| platform::is_process_alive(*pid)) else {
        println!("{} Agent not running", "○".dimmed());
        println!("  Run {} to start", "mobilecli-agent start".cyan());
        return;
    };
    let port = daemon::get_port().unwrap_or(config::DEFAULT_PORT);
    println!("{} Agent running (PID: {}, port: {})", "●".green(), pid, port);

    let sessions = match attach::fetch_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            println!("  {} {}", "Could not list sessions:".yellow(), e);
            return;
        }
    };
    if sessions.is_empty() {
        println!("{}", "  No active sessions".dimmed());
        return;
    }

    println!("\n{} {} active session(s):", "Sessions:".bold(), sessions.len());
    let now = chrono::Utc::now();
    for s in sessions {
        println!(
            "  {} {} [{:?}, {}] - {}",
            "→".cyan(),
            s.name.bold(),
            s.owner_kind,
            attach::format_age(s.started_at, now),
            s.path.dimmed()
        );
    }
}

fn show_history() {
    let store = history::SessionHistoryStore::load(history::history_file());
    let mut entries: Vec<_> = store.entries().collect();
    if entries.is_empty() {
        println!("{}", "No recent sessions".dimmed());
        return;
    }

    entries.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
    println!("{} {} recent session(s):", "History:".bold(), entries.len());
    for entry in entries {
        println!(
            "  {} {} {} - {}",
            entry.ended_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            entry.name.bold(),
            entry.session_id.dimmed(),
            entry.path
        );
    }
}
