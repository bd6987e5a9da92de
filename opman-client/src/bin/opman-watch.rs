//! opman-watch
//!
//! Follows the live log stream of one execution task from a terminal and exits
//! with the task's outcome.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use opman_client::ApiClient;
use opman_common::{ConsoleConfig, SessionCredentials, TaskId, TaskLog};
use opman_tasklog::{ChannelOptions, LogEntry, TaskLogs, WsConnector};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "opman-watch",
    version,
    about = "Follow the live logs of an execution task"
)]
struct Args {
    /// Task to follow
    task_id: TaskId,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// REST base URL, e.g. http://localhost:8080/api
    #[arg(long)]
    api_url: Option<String>,

    /// WebSocket base URL, e.g. ws://localhost:8080/api/ws
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token
    #[arg(long)]
    token: Option<String>,

    /// Log in with these credentials before connecting
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Print persisted logs before following the live stream
    #[arg(long)]
    history: bool,

    /// Give up after the first disconnect
    #[arg(long)]
    no_reconnect: bool,

    /// Delay before reconnecting, in milliseconds
    #[arg(long)]
    reconnect_ms: Option<u64>,

    /// Diagnostics filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

const EXIT_FAILED: u8 = 1;
const EXIT_INCOMPLETE: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let credentials = Arc::new(SessionCredentials::new(config.token.clone()));
    let api = ApiClient::new(&config.api, credentials.clone())
        .map_err(|err| anyhow!("cannot build HTTP client: {}", err))?;

    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        let auth = api
            .login(username, password)
            .await
            .map_err(|err| anyhow!("login failed: {}", err.user_message()))?;
        info!("logged in as {}", auth.user.username);
        credentials.set_token(auth.access_token);
    }

    if args.history {
        match api.task_logs(args.task_id).await {
            Ok(history) => history.iter().for_each(print_history),
            Err(err) => warn!("could not load log history: {}", err.user_message()),
        }
    }

    let connector = Arc::new(WsConnector::new(credentials));
    let options = ChannelOptions::from(&config.stream);
    info!(task_id = %args.task_id, url = %options.url_for(args.task_id), "following task");
    let logs = TaskLogs::follow(args.task_id, options, connector);

    let mut updates = logs.updates();
    let mut view = Printer::default();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                view.render(&logs);
                if changed.is_err() {
                    break;
                }
            }
            _ = logs.terminated() => {
                view.render(&logs);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                logs.disconnect();
                eprintln!("interrupted");
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    }

    let snapshot = logs.snapshot();
    match snapshot.result {
        Some(result) if result.success => {
            println!("task {} succeeded", args.task_id);
            if let Some(output) = result.output {
                println!("{}", output);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(result) => {
            println!(
                "task {} failed: {}",
                args.task_id,
                result.error.as_deref().unwrap_or("no error message")
            );
            Ok(ExitCode::from(EXIT_FAILED))
        }
        None => {
            eprintln!("log stream for task {} closed before completion", args.task_id);
            Ok(ExitCode::from(EXIT_INCOMPLETE))
        }
    }
}

fn load_config(args: &Args) -> Result<ConsoleConfig> {
    let mut config = ConsoleConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &args.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(url) = &args.ws_url {
        config.stream.base_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    if args.no_reconnect {
        config.stream.auto_reconnect = false;
    }
    if let Some(ms) = args.reconnect_ms {
        config.stream.reconnect_interval_ms = ms;
    }
    Ok(config)
}

fn print_history(log: &TaskLog) {
    println!(
        "{} {:<5} {}{}",
        log.timestamp.format("%Y-%m-%d %H:%M:%S"),
        log.log_level,
        source_tag(log.source.as_deref()),
        log.message
    );
}

fn print_entry(entry: &LogEntry) {
    println!(
        "{} {:<5} {}{}",
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.level,
        source_tag(entry.source.as_deref()),
        entry.message
    );
}

fn source_tag(source: Option<&str>) -> String {
    source.map(|s| format!("[{}] ", s)).unwrap_or_default()
}

#[derive(Default)]
struct Printer {
    printed: usize,
    progress: u8,
    connected: bool,
}

impl Printer {
    fn render(&mut self, logs: &TaskLogs) {
        let snapshot = logs.snapshot();
        if snapshot.is_connected != self.connected {
            self.connected = snapshot.is_connected;
            if self.connected {
                eprintln!("connected to task {}", snapshot.task_id);
            } else if !snapshot.is_complete {
                eprintln!("disconnected from task {}, live updates paused", snapshot.task_id);
            }
        }
        snapshot
            .entries_since(self.printed)
            .iter()
            .for_each(print_entry);
        self.printed = snapshot.entries.len();
        if snapshot.progress_percent != self.progress {
            self.progress = snapshot.progress_percent;
            match &snapshot.progress_message {
                Some(message) => eprintln!("progress {:>3}% {}", self.progress, message),
                None => eprintln!("progress {:>3}%", self.progress),
            }
        }
    }
}
