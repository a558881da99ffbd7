use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genchat_core::{
    Config, GenerationParameters, JsonPreferenceStore, MemoryPreferenceStore, OllamaFactory,
    PreferenceStore, Session,
};
use std::fs::{self, OpenOptions};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod handler;
mod repl;
mod tui;
mod ui;

use app::App;
use tui::{EventHandler, Tui};

#[derive(Parser)]
#[command(name = "genchat")]
#[command(version, about = "Chat with a local generative model, streaming or one-shot")]
struct Cli {
    /// Model to use (overrides GENCHAT_MODEL and the config file)
    #[arg(long, global = true)]
    model: Option<String>,
    /// Inference server URL (overrides GENCHAT_OLLAMA_URL and the config file)
    #[arg(long, global = true)]
    url: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Full-screen terminal chat (default)
    Tui,
    /// Line-by-line chat on stdin/stdout
    Repl {
        /// Start with streaming responses enabled
        #[arg(short, long)]
        stream: bool,
    },
    /// Send a single prompt and print the response
    Ask {
        /// The prompt text
        #[arg(required = true)]
        prompt: Vec<String>,
        /// Print the response as it is generated
        #[arg(short, long)]
        stream: bool,
    },
}

fn init_logging(to_file: bool) -> Result<()> {
    let default_level = if to_file { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if to_file {
        // Logging to the terminal would corrupt the TUI
        let dir = Config::config_dir()?;
        fs::create_dir_all(&dir)?;
        let path = dir.join("genchat.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {:?}", path))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn open_store() -> Box<dyn PreferenceStore + Send> {
    match JsonPreferenceStore::open_default() {
        Ok(store) => {
            info!(path = ?store.path(), "using preference store");
            Box::new(store)
        }
        Err(e) => {
            warn!(error = %e, "preferences unavailable, settings will not persist");
            Box::new(MemoryPreferenceStore::new())
        }
    }
}

async fn check_model(factory: &OllamaFactory) {
    match factory.has_model(factory.model()).await {
        Ok(true) => {}
        Ok(false) => warn!(
            model = factory.model(),
            "model not found on the server. Pull it with: ollama pull {}",
            factory.model()
        ),
        Err(e) => warn!(error = %e, "could not list models"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tui);

    init_logging(matches!(command, Commands::Tui))?;

    let config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read config, using defaults");
        Config::new()
    });
    let url = cli.url.unwrap_or_else(|| config.effective_url());
    let model = cli.model.unwrap_or_else(|| config.effective_model());

    let factory = OllamaFactory::new(&url, &model);
    check_model(&factory).await;

    let store = open_store();
    let params = GenerationParameters::load(store.as_ref());
    info!(url = %url, model = %model, ?params, "starting session");
    let session = Session::new(Arc::new(factory), params);

    match command {
        Commands::Tui => {
            let app = App::new(session, store, config.streaming_default(), model);
            let streaming = run_tui(app).await?;
            if Some(streaming) != config.streaming {
                Config::save_streaming(streaming)?;
            }
        }
        Commands::Repl { stream } => {
            let streaming = repl::run_repl(session, store, stream || config.streaming_default(), &model).await?;
            if Some(streaming) != config.streaming {
                Config::save_streaming(streaming)?;
            }
        }
        Commands::Ask { prompt, stream } => {
            let prompt = prompt.join(" ");
            let ok = repl::run_ask(session, &prompt, stream).await?;
            if !ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Run the terminal UI, returning the final streaming toggle position
async fn run_tui(mut app: App) -> Result<bool> {
    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = event_loop(&mut terminal, &mut app, &mut events).await;

    tui::restore()?;
    app.session.shutdown().await;
    result.map(|_| app.use_streaming)
}

async fn event_loop(terminal: &mut Tui, app: &mut App, events: &mut EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        tokio::select! {
            event = events.next() => match event {
                Some(event) => handler::handle_event(app, event),
                None => break,
            },
            Some(event) = app.session.next_event() => app.session.apply(event),
        }

        app.sync_engine().await;
    }
    Ok(())
}
