//! Opsdeck CLI - follow deployments, open remote shells, list processes.
//!
//! Thin front end over the `opsdeck` library.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};

use opsdeck::auth::{ApiClient, AuthEvent, TokenStore};
use opsdeck::connection::ConnectionManager;
use opsdeck::deployment::{
    DeploymentReconciler, HttpDeploymentStore, PushStream, ReconcilerOptions, ReconcilerUpdate,
    Severity,
};
use opsdeck::processes::{ProcessInfo, ProcessUpdate, ProcessWatcher};
use opsdeck::terminal::{MultiplexerEvent, TerminalMultiplexer};
use opsdeck::Config;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit code used when the session ends in a forced logout.
const EXIT_LOGGED_OUT: i32 = 2;

/// Session id of the single shell opened by `opsdeck shell`.
const SHELL_SESSION: u32 = 1;

#[derive(Parser)]
#[command(name = "opsdeck")]
#[command(version)]
#[command(about = "Follow deployments and open remote shells on opsdeck servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store credentials in the keyring
    Login {
        /// Account email
        #[arg(long)]
        email: String,
        /// Account password
        #[arg(long)]
        password: String,
    },
    /// Forget stored credentials
    Logout,
    /// Follow a deployment's logs until it finishes
    Logs {
        /// Deployment id
        deployment_id: String,
    },
    /// Open an interactive shell on a server
    Shell {
        /// Server id
        server_id: String,
        /// Directory to start in
        #[arg(long)]
        cwd: Option<String>,
        /// Terminal rows
        #[arg(long, default_value_t = 24)]
        rows: u16,
        /// Terminal columns
        #[arg(long, default_value_t = 80)]
        cols: u16,
    },
    /// List processes on a server
    Processes {
        /// Server id
        server_id: String,
        /// Keep watching for updates
        #[arg(long)]
        watch: bool,
    },
    /// Print the effective configuration
    Config,
}

/// Everything a subcommand needs.
struct App {
    config: Config,
    client: ApiClient,
    connections: Arc<ConnectionManager>,
}

impl App {
    fn new() -> Result<Self> {
        let config = Config::load()?;
        let tokens = TokenStore::persistent().context("Failed to load stored credentials")?;
        let client = ApiClient::new(config.base_url(), tokens.clone());
        let connections = Arc::new(ConnectionManager::for_server(&config, tokens));
        Ok(Self {
            config,
            client,
            connections,
        })
    }

    /// Exit cleanly when the refresh coordinator gives up on the session.
    fn watch_forced_logout(&self) {
        let mut events = self.client.refresh_coordinator().subscribe();
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Ok(AuthEvent::ForcedLogout { reason }) = events.recv().await {
                connections.disconnect();
                eprintln!("\nSession expired ({reason}). Run `opsdeck login` to sign in again.");
                std::process::exit(EXIT_LOGGED_OUT);
            }
        });
    }

    fn require_login(&self) -> Result<()> {
        anyhow::ensure!(
            self.client.tokens().is_authenticated(),
            "Not logged in. Run `opsdeck login --email <EMAIL> --password <PASSWORD>` first."
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let app = App::new()?;

    match cli.command {
        Commands::Login { email, password } => {
            app.client
                .login(&email, &password)
                .await
                .context("Login failed")?;
            println!("Logged in as {email}.");
        }
        Commands::Logout => {
            app.client.logout();
            println!("Logged out.");
        }
        Commands::Logs { deployment_id } => {
            app.require_login()?;
            app.watch_forced_logout();
            follow_logs(&app, &deployment_id).await?;
        }
        Commands::Shell {
            server_id,
            cwd,
            rows,
            cols,
        } => {
            app.require_login()?;
            app.watch_forced_logout();
            run_shell(&app, &server_id, cwd, rows, cols).await?;
        }
        Commands::Processes { server_id, watch } => {
            app.require_login()?;
            app.watch_forced_logout();
            list_processes(&app, &server_id, watch).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&app.config)?);
        }
    }

    app.connections.disconnect();
    Ok(())
}

async fn follow_logs(app: &App, deployment_id: &str) -> Result<()> {
    let store = Arc::new(HttpDeploymentStore::new(app.client.clone()));
    let push = PushStream::open(app.client.clone(), deployment_id);
    let mut reconciler = DeploymentReconciler::attach(
        deployment_id,
        app.connections.get_or_connect(),
        store,
        Some(push),
        ReconcilerOptions::from_config(&app.config),
    )
    .await;

    if !reconciler.state().is_in_progress() {
        if let Some(status) = reconciler.state().status() {
            println!("Deployment {deployment_id} is {status}.");
        }
        return Ok(());
    }

    while let Some(update) = reconciler.next_update().await {
        match &update {
            ReconcilerUpdate::Log(entry) => {
                let marker = match entry.severity {
                    Severity::Info => " ",
                    Severity::Success => "✓",
                    Severity::Warning => "!",
                    Severity::Error => "✗",
                };
                println!("{marker} {} {}", entry.timestamp, entry.text);
            }
            ReconcilerUpdate::Status { status, .. } => println!("── status: {status}"),
            ReconcilerUpdate::HistoryRefreshed(_)
            | ReconcilerUpdate::Rejoined
            | ReconcilerUpdate::PushStreamEnded => {}
        }
        if ends_follow(&update, reconciler.state().is_in_progress()) {
            break;
        }
    }
    Ok(())
}

/// `opsdeck logs` stops at a terminal status, without waiting for history.
fn ends_follow(update: &ReconcilerUpdate, in_progress: bool) -> bool {
    match update {
        ReconcilerUpdate::Status { status, .. } => status.is_terminal(),
        ReconcilerUpdate::HistoryRefreshed(_) => !in_progress,
        ReconcilerUpdate::Log(_) | ReconcilerUpdate::Rejoined | ReconcilerUpdate::PushStreamEnded => false,
    }
}

async fn run_shell(
    app: &App,
    server_id: &str,
    cwd: Option<String>,
    rows: u16,
    cols: u16,
) -> Result<()> {
    let mut mux = TerminalMultiplexer::with_scrollback(
        app.connections.get_or_connect(),
        server_id,
        app.config.scrollback_bytes,
    );
    mux.open(SHELL_SESSION, server_id, cwd)?;
    mux.start(SHELL_SESSION, rows, cols)?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut printed: u64 = 0;

    loop {
        tokio::select! {
            line = stdin.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    mux.send_input(SHELL_SESSION, &format!("{line}\r"));
                }
                None => break,
            },
            event = mux.next_event() => match event {
                Some(MultiplexerEvent::Output(_) | MultiplexerEvent::Exited(_)) => {
                    printed = print_new_output(&mux, printed)?;
                    if mux.session(SHELL_SESSION).is_some_and(|s| !s.state().is_open()) {
                        break;
                    }
                }
                Some(MultiplexerEvent::Ready(_)) => log::debug!("Shell ready"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    mux.close(SHELL_SESSION);
    Ok(())
}

/// Write the transcript bytes not printed yet; returns the new high-water mark.
fn print_new_output(mux: &TerminalMultiplexer, printed: u64) -> Result<u64> {
    let Some(session) = mux.session(SHELL_SESSION) else {
        return Ok(printed);
    };
    let transcript = session.transcript();
    let written = transcript.bytes_written();
    let fresh = usize::try_from(written - printed).unwrap_or(usize::MAX).min(transcript.len());
    let bytes = transcript.to_vec();

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes[bytes.len() - fresh..])?;
    stdout.flush()?;
    Ok(written)
}

async fn list_processes(app: &App, server_id: &str, watch: bool) -> Result<()> {
    let mut watcher = ProcessWatcher::attach(
        server_id,
        app.connections.get_or_connect(),
        Arc::new(app.client.clone()),
        app.config.process_poll_interval(),
    );

    if !watch {
        anyhow::ensure!(watcher.poll_now().await, "Could not list processes on {server_id}");
        print_processes(watcher.processes());
        return Ok(());
    }

    loop {
        tokio::select! {
            update = watcher.next_update() => match update {
                Some(ProcessUpdate::Pushed | ProcessUpdate::Polled) => print_processes(watcher.processes()),
                Some(ProcessUpdate::Resubscribed) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_processes(processes: &[ProcessInfo]) {
    println!("{:>7}  {:>6}  {:>10}  {:<12}  NAME", "PID", "CPU%", "MEM", "USER");
    for p in processes {
        println!(
            "{:>7}  {:>6.1}  {:>10}  {:<12}  {}",
            p.pid,
            p.cpu,
            p.memory,
            p.user.as_deref().unwrap_or("-"),
            p.command.as_deref().unwrap_or(&p.name)
        );
    }
}
