//! claude-esp — stream Claude Code sessions to the terminal
//!
//! Follows every recently active session (or one named with `--session`) and prints
//! thinking, tool calls, tool output and text as they're written.

use claude_esp::{
    SessionInfo, StreamEvent, StreamKind, Watcher, WatcherOptions, config, list_active_sessions,
    list_sessions,
};
use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// How many sessions `--list` shows.
const LIST_LIMIT: usize = 10;
const ID_WIDTH: usize = 12;
const PROJECT_WIDTH: usize = 50;

#[derive(Parser)]
#[command(name = "claude-esp", about = "Watch Claude Code sessions as they happen")]
struct Cli {
    /// Watch only this session (any part of its id)
    #[arg(short, long)]
    session: Option<String>,

    /// List recent sessions and exit
    #[arg(short, long, conflicts_with = "active")]
    list: bool,

    /// List sessions active in the last five minutes and exit
    #[arg(short, long)]
    active: bool,

    /// Start at the end of each log instead of replaying history
    #[arg(long)]
    skip_history: bool,

    /// Poll the filesystem instead of using change notifications
    #[arg(long)]
    poll: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("CLAUDE_ESP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout carries the event stream.
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Keep the tail of a long project path, which is the part that tells projects apart.
fn short_project(path: &str, max: usize) -> String {
    let len = path.chars().count();
    if len <= max {
        return path.to_string();
    }
    let tail: String = path.chars().skip(len - (max - 3)).collect();
    format!("...{tail}")
}

fn format_session(info: &SessionInfo) -> String {
    let marker = if info.is_active { '●' } else { ' ' };
    let id: String = info.id.chars().take(ID_WIDTH).collect();
    format!(
        "{marker} {id:<width$}  {}",
        short_project(&info.project_path, PROJECT_WIDTH),
        width = ID_WIDTH
    )
}

fn print_sessions(result: Result<Vec<SessionInfo>, claude_esp::WatcherError>, empty: &str) -> ExitCode {
    match result {
        Ok(sessions) if sessions.is_empty() => {
            println!("{empty}");
            ExitCode::SUCCESS
        }
        Ok(sessions) => {
            for info in &sessions {
                println!("{}", format_session(info));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("claude-esp: {e}");
            ExitCode::FAILURE
        }
    }
}

fn format_event(event: &StreamEvent) -> String {
    let label = match event.kind {
        StreamKind::Thinking => "thinking".to_string(),
        StreamKind::ToolInput => format!("→ {}", event.tool_name),
        StreamKind::ToolOutput if event.is_error => "← error".to_string(),
        StreamKind::ToolOutput => "←".to_string(),
        StreamKind::Text => "text".to_string(),
    };
    format!("[{}] {label}: {}", event.agent_name, event.content)
}

fn print_event(event: &StreamEvent, json: bool) {
    if !json {
        println!("{}", format_event(event));
        return;
    }
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to encode event"),
    }
}

async fn watch(cli: Cli) -> ExitCode {
    let mut config = config::load();
    config.force_poll |= cli.poll;

    let (watcher, mut streams) = match Watcher::with_options(WatcherOptions {
        session_id: cli.session,
        root: None,
        config,
    }) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("claude-esp: {e}");
            return ExitCode::FAILURE;
        }
    };
    debug!(mode = %watcher.mode(), root = %watcher.root().display(), "watching");
    watcher.set_skip_history(cli.skip_history);
    watcher.start();

    let json = cli.json;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(event) = streams.events.recv() => print_event(&event, json),
            Some(err) = streams.errors.recv() => warn!(error = %err, "watch error"),
            Some(new) = streams.new_sessions.recv() => {
                if !json {
                    println!("── new session {} ({})", new.session_id, new.project_path);
                }
            }
            Some(new) = streams.new_agents.recv() => {
                if !json {
                    println!("── new agent {}", claude_esp::agent_display_name(&new.agent_id));
                }
            }
            Some(new) = streams.new_tasks.recv() => {
                if !json {
                    println!("── background task {}", new.task.label);
                }
            }
            else => break,
        }
    }

    watcher.stop();
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list {
        return print_sessions(list_sessions(LIST_LIMIT), "No sessions found.");
    }
    if cli.active {
        let window = config::WatcherConfig::default().active_window();
        return print_sessions(
            list_active_sessions(window),
            "No sessions active in the last 5 minutes.",
        );
    }

    watch(cli).await
}
