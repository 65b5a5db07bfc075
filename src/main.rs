//! Binary entrypoint for the Starshard demo.
//!
//! Commands:
//! - `init [--config <path>]` - write a default `config.toml`
//! - `serve [--config <path>] [--user <id>] [--channel <id>]` - open every subsystem and
//!   drive a stdin/stdout REPL transport adapter over the command table in [`commands`]
//!
//! This binary exists to exercise the library crate end-to-end; a real deployment would
//! plug its own chat-transport adapter in place of the stdin REPL loop.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use starshard::channels::ChannelMembers;
use starshard::commands::{self, AppCore};
use starshard::config::Config;
use starshard::correlator::Correlator;
use starshard::games::blackjack::BlackjackCore;
use starshard::games::mines::MinesCore;
use starshard::games::onestroke::{OneStrokeCore, OneStrokeSession};
use starshard::ledger::Ledger;
use starshard::mail::MailDispatcher;
use starshard::redenvelope::RedEnvelopeEngine;
use starshard::scheduler;
use starshard::session::{InboundMessage, OutboundMessage, SessionRegistry};

#[derive(Parser)]
#[command(name = "starshard-demo")]
#[command(about = "Demo transport for the Starshard game-platform core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config.toml
    Init,
    /// Start an interactive stdin/stdout session against one user/channel
    Serve {
        #[arg(long, default_value = "demo-user")]
        user: String,
        #[arg(long, default_value = "demo-channel")]
        channel: String,
    },
}

fn init_logging(level: &str, verbosity: u8) {
    let base_level = match verbosity {
        0 => level.parse().unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(base_level).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("wrote default config to {}", cli.config);
            Ok(())
        }
        Commands::Serve { user, channel } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&config.logging.level, cli.verbose);
            info!("starting starshard-demo v{}", env!("CARGO_PKG_VERSION"));
            serve(config, user, channel).await
        }
    }
}

async fn serve(config: Config, user: String, channel: String) -> Result<()> {
    let data_dir = std::path::PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let ledger = Ledger::open(&data_dir)?;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let blackjack_sessions = SessionRegistry::new(outbound_tx.clone());
    let blackjack = Arc::new(BlackjackCore::new(&data_dir, ledger.clone(), blackjack_sessions.clone())?);

    let mines_sessions = SessionRegistry::new(outbound_tx.clone());
    let mines = Arc::new(MinesCore::new(&data_dir, ledger.clone(), mines_sessions.clone())?);

    let onestroke_sessions: SessionRegistry<OneStrokeSession> = SessionRegistry::new(outbound_tx.clone());
    let onestroke = Arc::new(OneStrokeCore::new(&data_dir, ledger.clone(), onestroke_sessions.clone())?);

    let red_envelopes = RedEnvelopeEngine::open(&data_dir, ledger.clone())?;
    let mail = MailDispatcher::open(&data_dir, ledger.clone())?;
    let channels = ChannelMembers::open(&data_dir)?;
    let correlator = Correlator::new();

    let _jobs = scheduler::spawn_background_jobs(correlator.clone(), red_envelopes.clone(), mail.clone(), &channels);

    let core = AppCore {
        ledger,
        config: Arc::new(config),
        blackjack,
        blackjack_sessions: blackjack_sessions.clone(),
        mines,
        mines_sessions: mines_sessions.clone(),
        onestroke,
        onestroke_sessions: onestroke_sessions.clone(),
        red_envelopes,
        mail,
        channels: channels.clone(),
        correlator: correlator.clone(),
    };

    // Print every outbound message the background game sessions emit.
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            println!("[{}] {}", message.channel_id, message.content);
        }
    });

    channels.add_member(&channel, &user, None)?;

    println!("starshard-demo ready. user={user} channel={channel}. type a command, or 'quit'.");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().eq_ignore_ascii_case("quit") {
            break;
        }
        let message = InboundMessage::new(&channel, &user, &uuid::Uuid::new_v4().to_string(), &line);

        // Any message from a user already in a game is routed to their session, not the
        // command table, the same precedence the teacher's dispatcher gives an active
        // door over the global command parser.
        if core.blackjack_sessions.is_in_game(&user).await {
            core.blackjack_sessions.route_message(&user, message).await;
            continue;
        }
        if core.mines_sessions.is_in_game(&user).await {
            core.mines_sessions.route_message(&user, message).await;
            continue;
        }
        // One-stroke has no `TurnHandle` to route through (see commands::dispatch); an
        // in-game message still falls through to dispatch, which consumes it as a move
        // string ahead of the regular command table.
        if core.onestroke_sessions.is_in_game(&user).await {
            match commands::dispatch(&core, &message).await {
                Ok(Some(reply)) => {
                    println!("[{channel}] {reply}");
                    std::io::stdout().flush().ok();
                }
                Ok(None) => {}
                Err(e) => println!("[{channel}] error: {e}"),
            }
            continue;
        }

        match commands::dispatch(&core, &message).await {
            Ok(Some(reply)) => {
                println!("[{channel}] {reply}");
                std::io::stdout().flush().ok();
            }
            Ok(None) => {}
            Err(e) => println!("[{channel}] error: {e}"),
        }
    }
    Ok(())
}
