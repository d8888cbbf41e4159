use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::info;

mod actions;
mod app;

use actions::Action;
use agent_deck::config::Config;
use agent_deck::events::DeckEvent;
use agent_deck::runtime::{Deck, DeckMessage};
use agent_deck::tmux::TmuxClient;
use app::App;

/// Logs go to a file; the terminal belongs to the dashboard
fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let path = config.log_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn interval(ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    let tmux_client = Arc::new(TmuxClient::new(config.tmux_path.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
    let (deck_tx, mut deck_rx) = mpsc::unbounded_channel::<DeckMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DeckEvent>();

    let mut deck = Deck::new(&config, tmux_client.clone(), deck_tx, Box::new(event_tx));
    deck.on_registry_tick();

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press {
                        let _ = input_tx.send(Action::KeyPress(key));
                    }
                }
            }
        }
    });

    let mut scan_timer = interval(config.scan_interval_ms);
    let mut orphan_timer = interval(config.orphan_gc_interval_ms);
    let mut stale_timer = interval(config.stale_gc_interval_ms);
    let mut registry_timer = interval(config.registry_refresh_ms);

    let mut app = App::new();

    let result = loop {
        app.sync(&deck);
        terminal.draw(|f| app.render(f))?;

        for pending_action in app.take_pending_actions() {
            match pending_action {
                Action::AttachSession(ref session) => {
                    // Suspend TUI and attach to session
                    ratatui::restore();

                    let cmd = tmux_client.attach_command(session);
                    let status = std::process::Command::new(&cmd[0])
                        .args(&cmd[1..])
                        .stdin(Stdio::inherit())
                        .stdout(Stdio::inherit())
                        .stderr(Stdio::inherit())
                        .status();

                    terminal = ratatui::init();

                    if let Err(e) = status {
                        app.message = Some(format!("Failed to attach: {}", e));
                    }
                    deck.on_scan_tick();
                }
                Action::RescanNow => deck.on_scan_tick(),
                Action::ReclaimWorkspace(ref workspace_id) => deck.reclaim_workspace(workspace_id),
                _ => {}
            }
        }

        tokio::select! {
            Some(action) = rx.recv() => {
                match app.handle_action(action) {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
            Some(message) = deck_rx.recv() => deck.handle(message),
            Some(event) = event_rx.recv() => app.on_event(&event),
            _ = scan_timer.tick() => deck.on_scan_tick(),
            _ = orphan_timer.tick() => deck.on_orphan_tick(),
            _ = stale_timer.tick() => deck.on_stale_tick(),
            _ = registry_timer.tick() => deck.on_registry_tick(),
        }
    };

    ratatui::restore();
    deck.shutdown().await;
    info!("Shut down");
    result
}
