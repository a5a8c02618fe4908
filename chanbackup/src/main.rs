// chanbackup maintains and recovers a Lightning-style node's static channel
// backup.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use hsmcore::config::NodeConfig;
use hsmcore::scb::{self, ChannelRecord, StaticChannelBackup};
use hsmcore::seed::SeedStore;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the node configuration file.
    #[arg(short, long, default_value = NodeConfig::DEFAULT_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild and atomically replace `emergency.recover` from a snapshot of
    /// the current channel list.
    Refresh {
        /// TOML file listing the node's current channels.
        channels: PathBuf,
    },
    /// Decrypt the local `emergency.recover` and print the channel stubs it
    /// contains, for forwarding to a channel-recovery RPC.
    Recover {
        /// Confirm that the channel list reports lost state for at least one
        /// channel. Without this, recovery is refused: this crate only
        /// drives recovery off that real runtime signal, never
        /// unconditionally.
        #[arg(long)]
        lost_state: bool,
    },
    /// Produce the `PEER_STORAGE` ciphertext to hand a channel peer so it can
    /// return our backup to us later.
    Export {
        /// File to write the hex-encoded ciphertext to. Printed to stdout if
        /// omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store an opaque `PEER_STORAGE` blob received from a peer, keyed by
    /// that peer's node id. Never decrypted locally: it isn't ours to read.
    Hold {
        /// The sending peer's node id, as hex.
        peer_node_id: String,
        /// File holding the hex-encoded payload, or `-` to read stdin.
        input: String,
    },
    /// Print the hex-encoded opaque bytes currently held for a peer, as
    /// previously stored by `hold`. Never decrypted: it isn't ours to read.
    Show {
        /// The peer's node id, as hex.
        peer_node_id: String,
    },
    /// Decrypt a `YOUR_PEER_STORAGE` payload (a peer returning data we
    /// previously gave it) and, on success, replace the local backup with
    /// it.
    Import {
        /// File holding the hex-encoded payload, or `-` to read stdin.
        input: String,
    },
}

#[derive(Deserialize)]
struct ChannelListFile {
    #[serde(rename = "channel", default)]
    channels: Vec<ChannelRecordToml>,
}

#[derive(Deserialize)]
struct ChannelRecordToml {
    channel_id: String,
    peer_node_id: String,
    funding_txid: String,
    funding_outnum: u32,
}

fn fixed_hex<const N: usize>(field: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(field)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::WrongLength { expected: N, got })
}

fn channel_record_from_toml(r: ChannelRecordToml) -> Result<ChannelRecord> {
    Ok(ChannelRecord {
        channel_id: fixed_hex(&r.channel_id)?,
        peer_node_id: fixed_hex(&r.peer_node_id)?,
        funding_txid: fixed_hex(&r.funding_txid)?,
        funding_outnum: r.funding_outnum,
    })
}

fn load_channel_list(path: impl AsRef<Path>) -> Result<Vec<ChannelRecord>> {
    let s = std::fs::read_to_string(path)?;
    let file: ChannelListFile = toml::from_str(&s)?;
    file.channels.into_iter().map(channel_record_from_toml).collect()
}

fn read_hex_input(input: &str) -> Result<Vec<u8>> {
    let s = if input == "-" {
        use std::io::Read;
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s)?;
        s
    } else {
        std::fs::read_to_string(input)?
    };
    Ok(hex::decode(s.trim())?)
}

fn scb_path(config: &NodeConfig) -> PathBuf {
    config.data_dir.join("emergency.recover")
}

fn peer_storage_path(config: &NodeConfig, peer_node_id: &[u8; 33]) -> PathBuf {
    config
        .data_dir
        .join("peer_storage")
        .join(hex::encode(peer_node_id))
}

/// Loads the shared root seed, creating it if this is the very first backup
/// operation on this node, and only prompting for a passphrase if the seed
/// file turns out to already be encrypted.
fn load_seed(config: &NodeConfig) -> Result<SeedStore> {
    let path = config.data_dir.join("hsm_secret");

    if let Some(store) = SeedStore::maybe_create_new(&path, None)? {
        return Ok(store);
    }

    match SeedStore::load(&path, None) {
        Ok(store) => Ok(store),
        Err(hsmcore::SeedError::PassphraseRequired) => {
            let passphrase = rpassword::prompt_password("Enter HSM passphrase: ")?;
            Ok(SeedStore::load(&path, Some(&passphrase))?)
        }
        Err(e) => Err(e.into()),
    }
}

fn logic() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;
    std::fs::create_dir_all(&config.data_dir)?;

    // Mirrors the reference plugin's startup `unlink_noerr("scb.tmp")`: flush
    // any temp file left behind by a refresh interrupted mid-write.
    scb::cleanup_stale_tmp(scb_path(&config))?;

    match cli.command {
        Commands::Refresh { channels } => {
            let seed = load_seed(&config)?;
            let channels = load_channel_list(channels)?;
            let backup = StaticChannelBackup::new(channels);

            scb::write(&seed, scb_path(&config), &backup)?;
            info!("wrote emergency.recover with {} channels", backup.channels.len());
        }
        Commands::Recover { lost_state } => {
            if !lost_state {
                warn!("refusing to recover: no channel in the current list reports lost state");
                return Ok(());
            }

            let seed = load_seed(&config)?;
            let backup = scb::read(&seed, scb_path(&config))?;

            println!(
                "recovered {} channels from backup taken at unix time {}",
                backup.channels.len(),
                backup.timestamp
            );
            for channel in &backup.channels {
                println!(
                    "channel_id={} peer_node_id={} funding_txid={} funding_outnum={}",
                    hex::encode(channel.channel_id),
                    hex::encode(channel.peer_node_id),
                    hex::encode(channel.funding_txid),
                    channel.funding_outnum,
                );
            }
        }
        Commands::Export { output } => {
            let seed = load_seed(&config)?;
            let backup = scb::read(&seed, scb_path(&config))?;
            let blob = scb::to_peer_storage(&seed, &backup)?;
            let encoded = hex::encode(blob);

            match output {
                Some(path) => std::fs::write(path, encoded)?,
                None => println!("{}", encoded),
            }
        }
        Commands::Hold { peer_node_id, input } => {
            let peer_node_id: [u8; 33] = fixed_hex(&peer_node_id)?;
            let payload = read_hex_input(&input)?;

            let path = peer_storage_path(&config, &peer_node_id);
            std::fs::create_dir_all(path.parent().expect("path always has a parent"))?;
            std::fs::write(&path, &payload)?;

            info!(
                "stored {} opaque bytes of peer storage for {}",
                payload.len(),
                hex::encode(peer_node_id)
            );
        }
        Commands::Show { peer_node_id } => {
            let peer_node_id: [u8; 33] = fixed_hex(&peer_node_id)?;
            let path = peer_storage_path(&config, &peer_node_id);

            let payload = std::fs::read(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NoPeerStorage,
                _ => Error::Io(e),
            })?;

            println!("{}", hex::encode(payload));
        }
        Commands::Import { input } => {
            let seed = load_seed(&config)?;
            let payload = read_hex_input(&input)?;

            let backup = match scb::from_peer_storage(&seed, &payload) {
                Ok(backup) => backup,
                Err(hsmcore::ScbError::PeerStorageAuthFail) => {
                    debug!("peer altered our data");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            scb::write(&seed, scb_path(&config), &backup)?;
            info!(
                "restored emergency.recover from peer storage, {} channels",
                backup.channels.len()
            );
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = logic() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
