//! `civic`: hub server and terminal editor for collaborative rooms.
//!
//! ```text
//! civic serve              run the hub (relay + mesh rendezvous)
//! civic edit [ROOM_ID]     edit a room from the terminal (solo without a room)
//! civic room               print a fresh room id
//! ```

mod editor;

use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use civic_collab::config::CollabConfig;
use civic_collab::ids::{IdSource, RandomIds};
use civic_collab::rewrite::StyleTag;
use civic_collab::server::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "civic")]
#[command(version)]
#[command(about = "Real-time collaborative plain-text editing", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:4444")]
        bind: String,

        /// Maximum members per room
        #[arg(long, default_value_t = 100)]
        max_peers_per_room: usize,
    },

    /// Edit a room from the terminal
    Edit {
        /// Room to join; edits solo when omitted
        room: Option<String>,

        /// Editor tone (happy or sad)
        #[arg(long, default_value = "happy")]
        style: StyleTag,

        /// Display name shown to collaborators
        #[arg(long)]
        name: Option<String>,

        /// Skip the peer mesh and use the relay
        #[arg(long)]
        relay: bool,
    },

    /// Print a fresh room id
    Room,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Room => {
            println!("{}", RandomIds::new().room_id());
            Ok(())
        }
        Commands::Serve {
            bind,
            max_peers_per_room,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            let server = SyncServer::new(ServerConfig {
                bind_addr: bind,
                max_peers_per_room,
                ..ServerConfig::default()
            });
            info!("Starting hub on {}", server.bind_addr());
            runtime.block_on(server.run())?;
            Ok(())
        }
        Commands::Edit {
            room,
            style,
            name,
            relay,
        } => {
            let mut config = CollabConfig::load(cli.config.as_deref())?;
            config.force_relay |= relay;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(editor::run(config, room, style, name))
        }
    }
}
