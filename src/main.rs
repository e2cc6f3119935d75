//! tactdeck: manage decks and keep them in sync from the command line.
//!
//! Usage: tactdeck <command> [args]

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tactdeck::cloud::{is_not_found, CloudError, JsonBinClient};
use tactdeck::config::Config;
use tactdeck::events::EventBus;
use tactdeck::media::PlaceholderMedia;
use tactdeck::models::Deck;
use tactdeck::peer::{PeerBroadcast, PeerState, WsTransport};
use tactdeck::quiz::QuizSession;
use tactdeck::storage::{DeckStorage, LocalStore, Origin, StoreEvent};
use tactdeck::sync::SyncOrchestrator;

const USAGE: &str = "\
Usage: tactdeck <command> [args]

Decks:
  decks                  list decks
  show <deck_id>         list a deck's cards
  import <file.json>     add or replace a deck from JSON
  export <deck_id>       print a deck as JSON
  delete <deck_id>       remove a deck
  sessions [deck_id]     list quiz results
  quiz <deck_id>         run a quiz (answer y/n, q to stop)

Cloud:
  share <deck_id>        upload or update the deck's snapshot
  pull <cloud_id>        download a snapshot into the local store
  sync                   pull every linked deck with a newer snapshot
  watch                  run sync on the configured interval

Peer:
  host                   wait for one peer to join
  join <peer_id>         connect to a hosting peer";

struct App {
    config: Config,
    store: Arc<LocalStore>,
}

impl App {
    fn orchestrator(&self) -> Result<SyncOrchestrator> {
        let cloud = JsonBinClient::new(&self.config.cloud.base_url, self.config.cloud.timeout())?;
        Ok(SyncOrchestrator::new(
            self.store.clone(),
            Arc::new(cloud),
            Arc::new(PlaceholderMedia),
            &self.config.sync.media_style,
        ))
    }

    fn peer(&self) -> PeerBroadcast {
        let transport = WsTransport::new(
            &self.config.peer.bind_addr,
            self.config.peer.advertise_host.clone(),
        );
        PeerBroadcast::new(self.store.clone(), Arc::new(transport))
    }

    async fn deck(&self, id: &str) -> Result<Deck> {
        self.store
            .get_deck(id)
            .await?
            .with_context(|| format!("no deck with id {id}"))
    }
}

fn arg<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    args.first()
        .map(String::as_str)
        .with_context(|| format!("missing <{name}>\n\n{USAGE}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tactdeck=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = Config::load()?;
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(LocalStore::open(&config.db_path()?, bus.clone())?);
    let app = App { config, store };

    let result = run(&app, &command, &args[1..]).await;
    bus.dispose();
    result
}

async fn run(app: &App, command: &str, args: &[String]) -> Result<()> {
    match command {
        "decks" => cmd_decks(app).await,
        "show" => cmd_show(app, arg(args, "deck_id")?).await,
        "import" => cmd_import(app, arg(args, "file.json")?).await,
        "export" => cmd_export(app, arg(args, "deck_id")?).await,
        "delete" => {
            app.store.delete_deck(arg(args, "deck_id")?, Origin::Local).await?;
            println!("deleted");
            Ok(())
        }
        "sessions" => cmd_sessions(app, args.first().map(String::as_str)).await,
        "quiz" => cmd_quiz(app, arg(args, "deck_id")?).await,
        "share" => {
            let cloud_id = app.orchestrator()?.push(arg(args, "deck_id")?).await?;
            println!("{cloud_id}");
            Ok(())
        }
        "pull" => cmd_pull(app, arg(args, "cloud_id")?).await,
        "sync" => {
            let report = app.orchestrator()?.auto_sync().await?;
            println!(
                "checked {}, pulled {}, failed {}",
                report.checked, report.pulled, report.failed
            );
            Ok(())
        }
        "watch" => cmd_watch(app).await,
        "host" => cmd_peer(app, None).await,
        "join" => cmd_peer(app, Some(arg(args, "peer_id")?)).await,
        _ => {
            eprintln!("Unknown command: {command}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn cmd_decks(app: &App) -> Result<()> {
    for deck in app.store.get_all_decks().await? {
        println!(
            "{}  {:<24} {:>3} cards  updated {}{}",
            deck.id,
            deck.name,
            deck.cards.len(),
            deck.updated_at.format("%Y-%m-%d %H:%M"),
            deck.cloud_sync_id
                .map(|id| format!("  cloud {id}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_show(app: &App, id: &str) -> Result<()> {
    let deck = app.deck(id).await?;
    println!("{} ({})", deck.name, deck.id);
    if !deck.description.is_empty() {
        println!("{}", deck.description);
    }
    for card in &deck.cards {
        let frames = card.display_frames().len();
        println!(
            "  {:<20} {:<6} {} frame(s)  {}",
            card.label,
            card.media_type,
            frames,
            card.original_description.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_import(app: &App, path: &str) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let deck: Deck = serde_json::from_str(&contents).context("Failed to parse deck JSON")?;
    let saved = app.store.save_deck(deck, Origin::Local).await?;
    println!("{}", saved.id);
    Ok(())
}

async fn cmd_export(app: &App, id: &str) -> Result<()> {
    let deck = app.deck(id).await?;
    println!("{}", serde_json::to_string_pretty(&deck)?);
    Ok(())
}

async fn cmd_sessions(app: &App, deck_id: Option<&str>) -> Result<()> {
    let sessions = match deck_id {
        Some(id) => app.store.get_sessions_for_deck(id).await?,
        None => app.store.get_all_sessions().await?,
    };
    for s in sessions {
        println!(
            "{}  {}  {}/{} correct, {} incorrect, {}s",
            s.date.format("%Y-%m-%d %H:%M"),
            s.deck_id,
            s.correct_count,
            s.total_cards,
            s.incorrect_count,
            s.duration_seconds
        );
    }
    Ok(())
}

async fn cmd_quiz(app: &App, id: &str) -> Result<()> {
    let deck = app.deck(id).await?;
    let mut quiz = QuizSession::start(&deck, true);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    while let Some(card) = quiz.current() {
        let (done, total) = quiz.progress();
        print!(
            "[{}/{}] {} ({} frame(s)) correct? [y/n/q] ",
            done + 1,
            total,
            card.label,
            card.display_frames().len()
        );
        io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        match line?.trim() {
            "y" | "Y" => quiz.answer(true),
            "n" | "N" => quiz.answer(false),
            "q" | "Q" => break,
            _ => continue,
        }
    }

    let result = app.store.save_session(&quiz.finish()).await?;
    println!(
        "{}/{} correct in {}s",
        result.correct_count, result.total_cards, result.duration_seconds
    );
    Ok(())
}

async fn cmd_pull(app: &App, cloud_id: &str) -> Result<()> {
    let existing = app
        .store
        .cloud_linked_decks()
        .await?
        .into_iter()
        .find(|d| d.cloud_sync_id.as_deref() == Some(cloud_id));

    let orchestrator = app.orchestrator()?;
    let result = orchestrator
        .reconcile_with_progress(cloud_id, existing.as_ref(), |p| {
            eprintln!("[{}/{}] {}", p.done, p.total, p.label);
        })
        .await;

    match result {
        Ok(deck) => {
            println!("{}  {}", deck.id, deck.name);
            Ok(())
        }
        Err(e) => {
            if e.downcast_ref::<CloudError>().is_some_and(is_not_found) {
                eprintln!("No shared deck with id {cloud_id}");
            }
            Err(e)
        }
    }
}

async fn cmd_watch(app: &App) -> Result<()> {
    let every = app
        .config
        .sync
        .auto_sync_interval()
        .context("auto-sync is disabled (sync.auto_sync_interval_secs = 0)")?;
    let handle = Arc::new(app.orchestrator()?).spawn_auto_sync(every);
    tokio::signal::ctrl_c().await?;
    handle.abort();
    Ok(())
}

async fn cmd_peer(app: &App, join: Option<&str>) -> Result<()> {
    let peer = app.peer();
    let _status = peer.subscribe_status(|status| match (&status.state, &status.local_id) {
        (PeerState::Connecting, Some(id)) => eprintln!("waiting for a peer at {id}"),
        (state, _) => eprintln!("peer {state}"),
    });
    let _received = app.store.events().subscribe(|event: &StoreEvent| {
        if event.from_sync() {
            match event {
                StoreEvent::DeckUpdate { deck, .. } => eprintln!("received {}", deck.name),
                StoreEvent::DeckDelete { id, .. } => eprintln!("peer deleted {id}"),
            }
        }
    });

    match join {
        Some(host_id) => peer.join(host_id).await?,
        None => {
            let id = peer.host().await?;
            println!("{id}");
        }
    }

    tokio::signal::ctrl_c().await?;
    peer.disconnect();
    Ok(())
}
