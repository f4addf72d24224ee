//! Strictly Matchmaking - command-line client
//!
//! Queues for a three-piece morris game and plays it from the terminal.

#![warn(missing_docs)]

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use std::sync::Arc;
use strictly_matchmaking::{
    ClientConfig, GameClient, GameSession, GameTransport, HttpTransport, KeyValueStore,
    MemoryStore, PollEvent, QueueEvent, QueuePersistence, QueueSession, QueueState,
    ResilientRpcClient, SqliteStore, SystemClock,
};
use strictly_morris::{Position, topology};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strictly_matchmaking=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Play {
            player_id,
            device_id,
        } => run_play(config, player_id, device_id).await,
        Command::Resume => run_resume(config).await,
        Command::Stats { limit } => run_stats(config, limit),
        Command::Board => {
            print_board();
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };
    let config = match &cli.server_url {
        Some(url) => config.with_server_url(url.clone()),
        None => config,
    };
    Ok(match &cli.store {
        Some(path) => config.with_store_path(Some(path.clone())),
        None => config,
    })
}

fn open_store(config: &ClientConfig) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match config.store_path() {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => {
            warn!("No store path configured; queue progress will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    })
}

struct Wiring {
    client: GameClient,
    queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    poll_events: mpsc::UnboundedReceiver<PollEvent>,
}

fn wire(
    config: &ClientConfig,
    store: Arc<dyn KeyValueStore>,
    device_id: &str,
) -> Result<Wiring> {
    let transport: Arc<dyn GameTransport> = Arc::new(HttpTransport::new(
        config.server_url(),
        Some(device_id.to_string()),
        config.request_timeout(),
    )?);
    let rpc = ResilientRpcClient::new();
    let persistence = QueuePersistence::new(
        store,
        Arc::new(SystemClock),
        config.persistence_policy(),
    );
    let (queue_tx, queue_events) = mpsc::unbounded_channel();
    let (poll_tx, poll_events) = mpsc::unbounded_channel();
    let queue = QueueSession::new(
        Arc::clone(&transport),
        rpc.clone(),
        persistence,
        config.queue_timings(),
        queue_tx,
    );
    let client = GameClient::new(transport, rpc, queue, config.poller_timings(), poll_tx);
    Ok(Wiring {
        client,
        queue_events,
        poll_events,
    })
}

#[instrument(skip(config), fields(server_url = %config.server_url()))]
async fn run_play(config: ClientConfig, player_id: String, device_id: String) -> Result<()> {
    let store = open_store(&config)?;
    let wiring = wire(&config, store, &device_id)?;
    wiring.client.queue().join(&player_id, &device_id)?;
    info!(%player_id, "Joined matchmaking");
    play_loop(wiring).await
}

#[instrument(skip(config), fields(server_url = %config.server_url()))]
async fn run_resume(config: ClientConfig) -> Result<()> {
    let store = open_store(&config)?;
    let probe = QueuePersistence::new(
        Arc::clone(&store),
        Arc::new(SystemClock),
        config.persistence_policy(),
    );
    let outcome = probe.load()?;
    let Some(snapshot) = outcome.snapshot() else {
        println!("No resumable queue session.");
        return Ok(());
    };

    let wiring = wire(&config, store, snapshot.device_id())?;
    if !wiring.client.queue().resume_from_persistence()? {
        println!("Stored queue session could not be resumed.");
        return Ok(());
    }
    println!(
        "Resumed queue session for {} ({}s already waited).",
        snapshot.player_id(),
        wiring.client.queue().time_in_queue().as_secs()
    );
    play_loop(wiring).await
}

fn run_stats(config: ClientConfig, limit: usize) -> Result<()> {
    let store = open_store(&config)?;
    let persistence = QueuePersistence::new(store, Arc::new(SystemClock), config.persistence_policy());

    match persistence.statistics()? {
        Some(latest) => println!("Latest: {}", latest),
        None => println!("No queue sessions recorded."),
    }
    let history = persistence.history()?;
    for entry in history.iter().rev().take(limit) {
        println!("  {}", entry);
    }
    Ok(())
}

fn print_board() {
    println!("{}", strictly_morris::Board::new().display());
    println!();
    for pos in Position::ALL {
        let neighbors: Vec<_> = topology::neighbors(pos)
            .into_iter()
            .map(|n| (n.to_index() + 1).to_string())
            .collect();
        println!("{} {:<14} -> {}", pos.to_index() + 1, pos.label(), neighbors.join(", "));
    }
}

fn parse_cell(token: &str) -> Option<Position> {
    match token.parse::<usize>() {
        Ok(n) if (1..=9).contains(&n) => Position::from_index(n - 1),
        _ => Position::parse(token),
    }
}

fn render(session: &GameSession) {
    let game = session.game();
    println!("{}", game.board().display());
    match game.winner() {
        Some(side) => println!("{} wins.", side),
        None => println!("{} to move ({:?} phase).", game.turn(), game.phase()),
    }
}

async fn handle_command(client: &GameClient, line: &str) -> Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["quit"] | ["exit"] => return Ok(false),
        ["leave"] => {
            if client.session().is_some() {
                client.leave_game().await?;
            } else {
                client.queue().leave_queue().await?;
            }
            println!("Left.");
            return Ok(false);
        }
        ["board"] => match client.session() {
            Some(session) => render(&session),
            None => println!("{}", client.queue().info().status()),
        },
        [cell] => {
            let Some(to) = parse_cell(cell) else {
                println!("Unknown cell: {}", cell);
                return Ok(true);
            };
            report(client.place(to).await);
        }
        [from, to] => match (parse_cell(from), parse_cell(to)) {
            (Some(from), Some(to)) => report(client.slide(from, to).await),
            _ => println!("Unknown cell"),
        },
        [] => {}
        _ => println!("Commands: <cell> | <from> <to> | board | leave | quit"),
    }
    Ok(true)
}

fn report(result: Result<strictly_matchmaking::MoveReceipt, strictly_matchmaking::ClientError>) {
    match result {
        Ok(receipt) => render(&receipt.session),
        Err(e) => println!("Move failed: {}", e),
    }
}

async fn play_loop(mut wiring: Wiring) -> Result<()> {
    let client = wiring.client.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = wiring.queue_events.recv() => match event {
                QueueEvent::StateChanged(info) => debug!(state = %info.state(), status = %info.status(), "Queue update"),
                QueueEvent::PositionUpdated { position, eta_secs } => {
                    println!("{} players in queue, about {}s to wait.", position, eta_secs);
                }
                QueueEvent::MatchFound(_) => {
                    let details = client.acknowledge_match()?;
                    println!("Match found. You are {}.", details.local_side());
                    render(details.session());
                }
                QueueEvent::Timeout => println!("No opponent found in time."),
                QueueEvent::Error(message) => {
                    println!("{}", message);
                    if client.queue().state() == QueueState::Idle && client.session().is_none() {
                        return Ok(());
                    }
                }
            },
            Some(event) = wiring.poll_events.recv() => match event {
                PollEvent::OpponentMoved(session) => {
                    println!("Opponent moved.");
                    render(&session);
                }
                PollEvent::OpponentJoined(session) => {
                    println!("Opponent joined.");
                    render(&session);
                }
                PollEvent::Updated(_) => {}
                PollEvent::GameEnded(session) => {
                    render(&session);
                    client.finish_game();
                    return Ok(());
                }
                PollEvent::TransientError { message, consecutive_failures } => {
                    println!("Connection problem ({}): {}", consecutive_failures, message);
                }
                PollEvent::Fatal(message) => {
                    println!("{}", message);
                    client.shutdown();
                    return Ok(());
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_command(&client, &line).await? {
                    return Ok(());
                }
            }
        }
    }

    let state = client.shutdown();
    debug!(%state, "Client shut down");
    Ok(())
}
