use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chat_stream_tui::api::ChatClient;
use chat_stream_tui::app::{run_app, App};
use chat_stream_tui::config::Config;
use chat_stream_tui::conversation::{ChatSettings, ConversationController};
use chat_stream_tui::display::ChannelDisplay;
use chat_stream_tui::error::AppError;
use chat_stream_tui::store::MemoryStore;
use clap::Parser;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-stream-tui", about = "Streaming Markdown chat in the terminal")]
struct Cli {
    /// Extra TOML config file, layered over ./chat.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(config: &Config, verbose: u8) -> Result<(), AppError> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // The terminal belongs to the UI, so logs go to a file.
    let log_file = OpenOptions::new().create(true).append(true).open(&config.log_file)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).map_err(AppError::Config)?;
    init_logging(&config, cli.verbose)?;
    info!(model = %config.model, base_url = %config.api_base_url, "Starting chat");

    let (tx, rx) = mpsc::channel(100);
    let controller = ConversationController::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ChatClient::new(&config)?),
        Arc::new(ChannelDisplay::new(tx)),
        ChatSettings::from(&config),
    );
    let mut app = App::new(controller, rx);
    app.start().await;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("TUI Error: {}", err);
    }

    Ok(())
}
