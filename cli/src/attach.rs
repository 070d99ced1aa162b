//! Attach command - watch a running session as a viewer
//!
//! Similar to `screen -x`: output from the owner is mirrored here and
//! keystrokes are forwarded to the owner. Nothing typed here goes upstream.

use crate::config::DEFAULT_PORT;
use crate::daemon;
use crate::protocol::{LocalInbound, LocalOutbound, SessionSummary};
use chrono::{DateTime, Utc};
use colored::Colorize;
use futures_util::{SinkExt, StreamExt};
use std::io::{self, Read, Write};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type LocalSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn agent_url() -> Result<String, Box<dyn std::error::Error>> {
    if !daemon::is_running() {
        return Err("Agent is not running. Start it with 'mobilecli-agent start' first.".into());
    }
    let port = daemon::get_port().unwrap_or(DEFAULT_PORT);
    Ok(format!("ws://127.0.0.1:{}", port))
}

async fn send(ws: &mut LocalSocket, msg: &LocalInbound) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(Message::Text(serde_json::to_string(msg)?)).await?;
    Ok(())
}

/// Wait for the first message the predicate accepts
async fn expect<T>(
    ws: &mut LocalSocket,
    mut accept: impl FnMut(LocalOutbound) -> Option<T>,
) -> Result<T, Box<dyn std::error::Error>> {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(msg) = serde_json::from_str::<LocalOutbound>(&text) {
                if let Some(value) = accept(msg) {
                    return Ok(value);
                }
            }
        }
    }
    Err("Agent closed the connection".into())
}

async fn connect_authenticated(url: &str) -> Result<LocalSocket, Box<dyn std::error::Error>> {
    let (mut ws, _) = connect_async(url).await?;
    send(&mut ws, &LocalInbound::Authenticate { token: None }).await?;
    expect(&mut ws, |msg| matches!(msg, LocalOutbound::AuthSuccess).then_some(())).await?;
    Ok(ws)
}

/// Ask the running agent for its sessions
pub async fn fetch_sessions() -> Result<Vec<SessionSummary>, Box<dyn std::error::Error>> {
    let url = agent_url()?;
    let mut ws = connect_authenticated(&url).await?;
    send(&mut ws, &LocalInbound::ListSessions).await?;
    let sessions = expect(&mut ws, |msg| match msg {
        LocalOutbound::SessionsList { sessions } => Some(sessions),
        _ => None,
    })
    .await?;
    let _ = ws.close(None).await;
    Ok(sessions)
}

/// Run the attach command
pub async fn run(query: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let url = agent_url()?;
    let sessions = fetch_sessions().await?;

    if sessions.is_empty() {
        println!("{}", "No active sessions to attach to.".yellow());
        return Ok(());
    }

    let session = match query.as_deref() {
        Some(query) => find_session(&sessions, query),
        None if sessions.len() == 1 => sessions.first(),
        None => show_session_picker(&sessions)?,
    };
    let Some(session) = session.cloned() else {
        println!("{}", "No session selected.".dimmed());
        return Ok(());
    };

    println!(
        "{} Attaching to {} ({})",
        "→".cyan(),
        session.name.bold(),
        short_id(&session.session_id).dimmed()
    );
    run_attached(&url, &session).await
}

/// Match by id prefix first, then by name
pub fn find_session<'a>(sessions: &'a [SessionSummary], query: &str) -> Option<&'a SessionSummary> {
    let lowered = query.to_lowercase();
    sessions
        .iter()
        .find(|s| s.session_id.starts_with(query))
        .or_else(|| {
            sessions
                .iter()
                .find(|s| s.name.to_lowercase().contains(&lowered))
        })
}

fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

/// "3h" or "12m"
pub fn format_age(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(started_at);
    if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}

fn show_session_picker(sessions: &[SessionSummary]) -> io::Result<Option<&SessionSummary>> {
    println!();
    println!(
        "{}",
        "╔═════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║              MobileCLI Agent - Attach to Session            ║".cyan()
    );
    println!(
        "{}",
        "╚═════════════════════════════════════════════════════════════╝".cyan()
    );
    println!();

    let now = Utc::now();
    for (i, session) in sessions.iter().enumerate() {
        println!(
            "  {}. {} [{}, {:?}] - {}",
            (i + 1).to_string().bold(),
            session.name.green(),
            format_age(session.started_at, now).dimmed(),
            session.owner_kind,
            session.path.dimmed()
        );
    }

    println!();
    print!("Enter session number [1-{}] or 'q' to quit: ", sessions.len());
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.eq_ignore_ascii_case("q") {
        return Ok(None);
    }

    match input.parse::<usize>() {
        Ok(n) if (1..=sessions.len()).contains(&n) => Ok(sessions.get(n - 1)),
        _ => {
            println!("{}", "Invalid selection.".red());
            Ok(None)
        }
    }
}

async fn run_attached(url: &str, session: &SessionSummary) -> Result<(), Box<dyn std::error::Error>> {
    let mut ws = connect_authenticated(url).await?;
    send(
        &mut ws,
        &LocalInbound::AttachSession {
            session_id: session.session_id.clone(),
        },
    )
    .await?;
    expect(&mut ws, |msg| match msg {
        LocalOutbound::AttachSuccess { .. } => Some(Ok(())),
        LocalOutbound::AttachError { error, .. } => Some(Err(error)),
        _ => None,
    })
    .await??;

    let (mut tx, mut rx) = ws.split();

    #[cfg(unix)]
    let original_termios = setup_raw_mode()?;

    println!("\r{}", "─".repeat(60).dimmed());
    println!(
        "\r{} Press {} to detach",
        "Attached:".green().bold(),
        "Ctrl+D".cyan().bold()
    );
    println!("\r{}", "─".repeat(60).dimmed());

    let (input_tx, mut input_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // Ctrl+D on its own detaches
                    if n == 1 && buf[0] == 0x04 {
                        break;
                    }
                    if input_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });

    let session_id = session.session_id.clone();
    let mut session_ended = false;

    loop {
        tokio::select! {
            result = rx.next() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<LocalOutbound>(&text) {
                            Ok(LocalOutbound::TerminalOutput { session_id: sid, data }) if sid == session_id => {
                                let mut stdout = io::stdout();
                                let _ = stdout.write_all(data.as_bytes());
                                let _ = stdout.flush();
                            }
                            Ok(LocalOutbound::SessionEnded { session_id: sid, reason, exit_code }) if sid == session_id => {
                                session_ended = true;
                                let code = exit_code.map(|c| format!(", exit code {}", c)).unwrap_or_default();
                                println!("\r\n{} Session ended ({:?}{})", "─".repeat(40).dimmed(), reason, code);
                                break;
                            }
                            Ok(LocalOutbound::BridgeDisconnected) => {
                                println!("\r\n{}\r", "Bridge connection lost; mobile devices are offline.".yellow());
                            }
                            Ok(LocalOutbound::BridgeReconnected) => {
                                println!("\r\n{}\r", "Bridge connection restored.".green());
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        println!("\r\n{}", "Connection closed.".yellow());
                        break;
                    }
                    _ => {}
                }
            }

            Some(input) = input_rx.recv() => {
                let msg = LocalInbound::TerminalInput {
                    session_id: Some(session_id.clone()),
                    data: String::from_utf8_lossy(&input).to_string(),
                };
                let text = serde_json::to_string(&msg)?;
                if tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            else => break,
        }
    }

    #[cfg(unix)]
    {
        let _ = restore_terminal_mode(&original_termios);
    }

    if !session_ended {
        println!("\r\n{}", "Detached from session.".dimmed());
    }
    Ok(())
}

/// Put stdin into raw mode, returning the previous settings
#[cfg(unix)]
fn setup_raw_mode() -> io::Result<nix::sys::termios::Termios> {
    use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg};

    let stdin = io::stdin();
    let original = termios::tcgetattr(&stdin).map_err(io::Error::other)?;

    let mut raw = original.clone();
    raw.local_flags
        .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
    raw.input_flags.remove(InputFlags::ICRNL | InputFlags::IXON);

    termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(io::Error::other)?;
    Ok(original)
}

#[cfg(unix)]
fn restore_terminal_mode(original: &nix::sys::termios::Termios) -> io::Result<()> {
    use nix::sys::termios::{self, SetArg};

    termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, original).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OwnerKind;
    use chrono::Duration;

    fn summary(id: &str, name: &str) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            name: name.to_string(),
            path: format!("/srv/{}", name),
            started_at: Utc::now(),
            owner_kind: OwnerKind::Managed,
            source: OwnerKind::Managed.source(),
        }
    }

    #[test]
    fn test_find_session_by_prefix_then_name() {
        let sessions = vec![summary("a1b2c3d4-0000", "api"), summary("ffee0011-0000", "Web App")];

        assert_eq!(find_session(&sessions, "a1b2").unwrap().name, "api");
        assert_eq!(find_session(&sessions, "web").unwrap().session_id, "ffee0011-0000");
        assert!(find_session(&sessions, "nothing").is_none());
    }

    #[test]
    fn test_format_age() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::minutes(12), now), "12m");
        assert_eq!(format_age(now - Duration::hours(3), now), "3h");
        // Clock skew never shows a negative age
        assert_eq!(format_age(now + Duration::minutes(5), now), "0m");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
