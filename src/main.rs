use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use relaystream::commands::{
    ADMIN_HELP, AdminCommand, CLIENT_HELP, ClientCommand, CommandError, parse_admin, parse_client,
};
use relaystream::file_transfer::{ProgressObserver, TransferProgress, TransferTarget};
use relaystream::network::{Client, ClientEvent, ClientOptions, RelayConfig, RelayHandle, Server, SessionInfo};
use relaystream::utils::{
    chat_timestamp, format_chat_line, format_duration, format_size, format_speed, transfer_bar_style,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay with an admin console on stdin
    Server {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Join a relay as a chat client
    Client {
        /// Display name in the chat
        #[arg(short, long)]
        name: String,

        /// Relay host
        #[arg(long)]
        host: Option<String>,

        /// Relay port
        #[arg(short, long)]
        port: Option<u16>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

// Returns a WorkerGuard that must be kept alive for logs to be written
fn init_logging(log_dir: &Path, log_file_prefix: &str, default_filter: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false);

    // stdout belongs to the chat view
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(path: Option<&Path>, host: Option<String>, port: Option<u16>) -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::load_or_default(path);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

/// Drives an indicatif bar from transfer progress
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new(label: String) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(transfer_bar_style());
        bar.set_message(label);
        Self { bar }
    }
}

impl ProgressObserver for BarObserver {
    fn on_progress(&self, progress: &TransferProgress) {
        self.bar.set_length(progress.total_bytes);
        self.bar.set_position(progress.bytes_transferred);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { host, port, config } => {
            let config = load_config(config.as_deref(), host, port)?;
            let _guard = init_logging(&config.log_dir, "relaystream_server", "info")?;
            config.ensure_directories()?;
            run_server(config).await
        }
        Commands::Client {
            name,
            host,
            port,
            config,
        } => {
            let config = load_config(config.as_deref(), host, port)?;
            let _guard = init_logging(&config.log_dir, "relaystream_client", "warn")?;
            config.ensure_directories()?;
            run_client(config, name).await
        }
    }
}

async fn run_server(config: RelayConfig) -> anyhow::Result<()> {
    let server = Server::bind(&config)
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    let addr = server.local_addr()?;
    let handle = server.handle();

    println!("Relay listening on {addr}");
    println!("Received files go to {}", config.received_dir.display());
    println!("Type /help for admin commands");

    let console = tokio::spawn(admin_console(handle.clone()));
    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    console.abort();

    info!("relay stopped");
    result.context("relay stopped with an error")
}

async fn admin_console(handle: RelayHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "admin console input failed");
                break;
            }
        };

        match parse_admin(&line) {
            Ok(command) => {
                if !run_admin_command(&handle, command).await {
                    break;
                }
            }
            Err(CommandError::Empty) => {}
            Err(e) => println!("{e}"),
        }
    }
}

/// Returns false once the relay should stop
async fn run_admin_command(handle: &RelayHandle, command: AdminCommand) -> bool {
    match command {
        AdminCommand::Broadcast(body) => {
            let report = handle.broadcast_text(&body).await;
            println!("Sent to {} user(s)", report.delivered);
        }
        AdminCommand::Direct { name, body } => {
            if handle.direct_text(&name, &body).await {
                println!("Private message sent to '{name}'");
            } else {
                println!("User '{name}' is not online");
            }
        }
        AdminCommand::SendFile { target, path } => {
            let handle = handle.clone();
            tokio::spawn(async move { admin_send_file(handle, target, path).await });
        }
        AdminCommand::List => {
            let sessions = handle.session_list().await;
            println!("{} user(s) online", sessions.len());
            for info in &sessions {
                print_session_line(info);
            }
        }
        AdminCommand::User(name) => match handle.session_info(&name).await {
            Some(info) => print_session_details(&info),
            None => println!("User '{name}' is not online"),
        },
        AdminCommand::Find(pattern) => {
            let sessions = handle.find_sessions(&pattern).await;
            if sessions.is_empty() {
                println!("No user matches '{pattern}'");
            }
            for info in &sessions {
                print_session_line(info);
            }
        }
        AdminCommand::Help => println!("{ADMIN_HELP}"),
        AdminCommand::Quit => {
            println!("Shutting the relay down...");
            handle.shutdown();
            return false;
        }
    }
    true
}

async fn admin_send_file(handle: RelayHandle, target: TransferTarget, path: PathBuf) {
    let observer = BarObserver::new(format!("{} -> {target}", path.display()));
    match handle.send_file(target, &path, &observer).await {
        Ok(summary) => observer.bar.finish_with_message(format!(
            "sent {} ({}) in {} chunks, {}",
            summary.filename,
            format_size(summary.total_bytes),
            summary.chunk_count,
            format_duration(summary.elapsed),
        )),
        Err(e) => observer.bar.abandon_with_message(format!("send failed: {e}")),
    }
}

fn print_session_line(info: &SessionInfo) {
    println!(
        "  {:<20} {:<22} since {}",
        info.name,
        info.peer_addr,
        info.connected_at.format("%H:%M:%S")
    );
}

fn print_session_details(info: &SessionInfo) {
    println!("User:      {}", info.name);
    println!("Session:   {}", info.id);
    println!("Address:   {}", info.peer_addr);
    println!("Connected: {}", info.connected_at.format("%Y-%m-%d %H:%M:%S"));
    match &info.inbound_transfer {
        Some(progress) => {
            let percent = progress
                .percentage()
                .map(|p| format!("{p:.1}%"))
                .unwrap_or_else(|| "?".to_string());
            println!(
                "Receiving: {} {}/{} ({percent}, {})",
                progress.filename,
                format_size(progress.bytes_transferred),
                format_size(progress.total_bytes),
                format_speed(progress.bytes_per_second()),
            );
        }
        None => println!("Receiving: nothing"),
    }
}

async fn run_client(config: RelayConfig, name: String) -> anyhow::Result<()> {
    let addr = config.socket_addr().await?;
    let (client, events) = Client::connect(addr, &name, ClientOptions::from_config(&config)).await?;
    let client = Arc::new(client);

    println!("Connected to {addr} as '{name}'. Type /help for commands.");
    let mut printer = tokio::spawn(print_events(events));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_client(&line) {
                    Ok(ClientCommand::Chat(body)) => {
                        client.send_text(&body).await?;
                        println!("{}", format_chat_line(&chat_timestamp(Local::now()), client.name(), &body));
                    }
                    Ok(ClientCommand::SendFile(path)) => {
                        let client = Arc::clone(&client);
                        tokio::spawn(async move { client_send_file(client, path).await });
                    }
                    Ok(ClientCommand::Help) => println!("{CLIENT_HELP}"),
                    Ok(ClientCommand::Quit) => break,
                    Err(CommandError::Empty) => {}
                    Err(e) => println!("{e}"),
                }
            }
            _ = &mut printer => return Ok(()),
        }
    }

    if let Err(e) = client.leave().await {
        info!(error = %e, "leave could not be sent");
    }
    println!("Bye!");
    Ok(())
}

async fn client_send_file(client: Arc<Client>, path: PathBuf) {
    let observer = BarObserver::new(format!("sending {}", path.display()));
    match client.send_file(&path, &observer).await {
        Ok(summary) => observer.bar.finish_with_message(format!(
            "sent {} ({}) at {}",
            summary.filename,
            format_size(summary.total_bytes),
            format_speed(summary.bytes_per_second()),
        )),
        Err(e) => observer.bar.abandon_with_message(format!("send failed: {e}")),
    }
}

async fn print_events(mut events: tokio::sync::mpsc::Receiver<ClientEvent>) {
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Text { line, .. } => println!("{line}"),
            ClientEvent::Notice(notice) => println!("* {notice}"),
            ClientEvent::FileIncoming {
                filename,
                size,
                sender,
                ..
            } => {
                println!("* {sender} is sending {filename} ({})", format_size(size));
                let incoming = ProgressBar::new(size);
                incoming.set_style(transfer_bar_style());
                incoming.set_message(format!("receiving {filename}"));
                bar = Some(incoming);
            }
            ClientEvent::FileProgress(progress) => {
                if let Some(bar) = &bar {
                    bar.set_position(progress.bytes_transferred);
                }
            }
            ClientEvent::FileReceived(file) => {
                let message = format!(
                    "saved {} ({}) to {} at {}",
                    file.filename,
                    format_size(file.bytes_received),
                    file.path.display(),
                    format_speed(file.bytes_per_second()),
                );
                match bar.take() {
                    Some(bar) => bar.finish_with_message(message),
                    None => println!("* {message}"),
                }
            }
            ClientEvent::ServerError(message) => println!("! relay error: {message}"),
            ClientEvent::Disconnected { reason } => {
                if let Some(bar) = bar.take() {
                    bar.abandon_with_message("transfer interrupted");
                }
                match reason {
                    Some(reason) => println!("* disconnected: {reason}"),
                    None => println!("* disconnected from the relay"),
                }
                break;
            }
        }
    }
}
