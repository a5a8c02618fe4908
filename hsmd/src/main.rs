// hsmd is the single-threaded key-custody dispatcher of a Lightning-style
// payment node.
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
mod fdpass;

use error::*;

use hsmcore::config::NodeConfig;
use hsmcore::dispatch::{exit_code, Capability, ConnKey, PendingFd, Session, SessionTable};
use hsmcore::message::{
    BadRequestReply, ClientHsmFdReply, ClientHsmFdRequest, Frame, InitReply, InitRequest,
    OpaqueReply, OpaqueRequest, Tag,
};
use hsmcore::seed::SeedStore;
use hsmcore::system;

use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use daemonizr::{Daemonizr, DaemonizrError, Stderr, Stdout};
use tracing::{debug, error, info, warn};

const PWD: &str = "/";
const PIDFILE: &str = "/run/hsmd.pid";
const LOGFILE_STDOUT: &str = "/var/log/hsmd.out";
const LOGFILE_STDERR: &str = "/var/log/hsmd.err";

/// How long a single `poll(2)` call blocks before re-checking the shutdown
/// flag.
const POLL_TIMEOUT_MS: i32 = 200;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Single-threaded dispatcher owning the root seed and brokering capability-gated
/// client sessions over a Unix-domain control socket.
struct Args {
    /// Path of the node configuration file.
    #[arg(short, long, default_value = NodeConfig::DEFAULT_PATH)]
    config: PathBuf,
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if !args.debug {
        match Daemonizr::new()
            .work_dir(PathBuf::from(PWD))
            .expect("invalid workdir")
            .pidfile(PathBuf::from(PIDFILE))
            .stdout(Stdout::Redirect(PathBuf::from(LOGFILE_STDOUT)))
            .stderr(Stderr::Redirect(PathBuf::from(LOGFILE_STDERR)))
            .umask(0o027)
            .expect("invalid umask")
            .spawn()
        {
            Ok(_) => {}
            Err(DaemonizrError::AlreadyRunning) => {
                match Daemonizr::new()
                    .work_dir(PathBuf::from(PWD))
                    .unwrap()
                    .pidfile(PathBuf::from(PIDFILE))
                    .search()
                {
                    Ok(pid) => {
                        error!("another daemon with PID {} is already running", pid);
                        process::exit(1);
                    }
                    Err(e) => error!("daemonization PID search error: {}", e),
                }
            }
            Err(e) => {
                error!("daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    match serve(&args.config) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("fatal: {}", e);
            process::exit(3);
        }
    }
}

/// Derives a deterministic, seed-bound reply so a real signing/ECDH
/// collaborator can be dropped in later without changing the wire contract.
/// `SPEC_FULL.md` §4.3 leaves the actual cryptographic computation to that
/// external collaborator; this core only needs to exercise capability-gated
/// dispatch end to end.
fn stub_reply(seed: &SeedStore, label: &[u8], db_id: u64, payload: &[u8]) -> Vec<u8> {
    let key = seed.derive_secret(label);
    let mut data = db_id.to_be_bytes().to_vec();
    data.extend_from_slice(payload);
    system::hash_hmac(&key, &data).to_vec()
}

/// Owns every live session and, via [`SessionTable`], the I/O connection
/// that belongs to it: there is no second, separate connection store to
/// fall out of sync with the table. Forced replacement of a `db_id`
/// therefore closes the incumbent connection as part of the same
/// operation that installs the new session (`SessionTable::insert`'s
/// doc comment).
struct Dispatcher {
    table: SessionTable<UnixStream>,
    master_key: ConnKey,
    pending_fd: PendingFd,
    seed: Option<Arc<SeedStore>>,
    chain_params: Option<String>,
    data_dir: PathBuf,
}

impl Dispatcher {
    fn new(data_dir: PathBuf, master_stream: UnixStream) -> Result<Self> {
        let mut table = SessionTable::new();
        let master_key = table.insert_zero_dbid(Session::new(
            0,
            Capability::Master as u32 | Capability::SignGossip as u32 | Capability::Ecdh as u32,
            None,
            master_stream,
        ))?;

        Ok(Self {
            table,
            master_key,
            pending_fd: PendingFd::new(),
            seed: None,
            chain_params: None,
            data_dir,
        })
    }

    fn seed(&self) -> Result<&SeedStore> {
        self.seed.as_deref().ok_or_else(|| {
            Error::Dispatch(hsmcore::DispatchError::BadRequest(
                "request received before INIT",
            ))
        })
    }

    /// Handles one frame read from the connection identified by `key`.
    /// Returns `Ok(false)` if that connection must be closed.
    fn handle_frame(&mut self, key: ConnKey, frame: Frame) -> Result<bool> {
        let session = self
            .table
            .get(key)
            .expect("frame read from a connection absent from the table");
        let db_id = session.db_id;
        let authorized = session.authorize(frame.tag);

        if let Err(e) = authorized {
            warn!("<{:?}> bad request: {}", key, e);
            self.reply(
                key,
                Tag::BadRequestReply,
                &BadRequestReply {
                    reason: e.to_string(),
                },
            )?;
            return Ok(false);
        }

        match frame.tag {
            Tag::Init => {
                let req: InitRequest = frame.decode_body()?;
                let path = self.data_dir.join("hsm_secret");

                let store = match SeedStore::maybe_create_new(&path, req.passphrase.as_deref())? {
                    Some(store) => store,
                    None => SeedStore::load(&path, req.passphrase.as_deref())?,
                };

                let node_id_secret = store.derive_secret(b"node-id");
                let mut node_id = [0u8; 33];
                node_id[0] = 0x02;
                node_id[1..].copy_from_slice(&node_id_secret);
                let bip32_ext_pubkey = store.derive_secret(b"bip32-ext-pubkey").to_vec();

                self.chain_params = Some(req.chain_params);
                self.seed = Some(Arc::new(store));

                info!("<master> initialized");

                self.reply(
                    key,
                    Tag::InitReply,
                    &InitReply {
                        node_id,
                        bip32_ext_pubkey,
                    },
                )?;
                Ok(true)
            }
            Tag::ClientHsmFd => {
                let req: ClientHsmFdRequest = frame.decode_body()?;
                let (local_end, remote_end) = UnixStream::pair()?;

                // Stage the descriptor before it becomes reachable through
                // the table, matching the single staging slot between
                // acknowledging the request and handing the descriptor off.
                self.pending_fd.stage(remote_end.as_raw_fd());

                let new_session =
                    Session::new(req.db_id, req.capabilities, req.node_id, local_end);
                let new_key = if req.db_id == 0 {
                    self.table.insert_zero_dbid(new_session)?
                } else {
                    // Replaces whatever session previously held this db_id,
                    // closing its connection as part of the same insert.
                    self.table.insert(new_session)
                };

                info!("new client db_id={} key={:?}", req.db_id, new_key);

                self.reply(key, Tag::ClientHsmFdReply, &ClientHsmFdReply)?;

                let fd = self
                    .pending_fd
                    .take()
                    .expect("just staged above, nothing else can take it first");
                let master = self
                    .table
                    .get(self.master_key)
                    .expect("master is always connected");
                fdpass::send_fd(&master.conn, fd)?;
                drop(remote_end);

                Ok(true)
            }
            Tag::SignCommitmentTx | Tag::Ecdh => {
                let req: OpaqueRequest = frame.decode_body()?;
                let (label, reply_tag): (&[u8], Tag) = if frame.tag == Tag::SignCommitmentTx {
                    (b"sign-commitment-tx", Tag::SignCommitmentTxReply)
                } else {
                    (b"ecdh", Tag::EcdhReply)
                };
                let payload = stub_reply(self.seed()?, label, db_id, &req.payload);
                self.reply(key, reply_tag, &OpaqueReply { payload })?;
                Ok(true)
            }
            #[cfg(feature = "dev")]
            Tag::DevMemleak => {
                self.reply(
                    key,
                    Tag::BadRequestReply,
                    &BadRequestReply {
                        reason: "DEV_MEMLEAK is not implemented by this core".to_string(),
                    },
                )?;
                Ok(true)
            }
            Tag::PeerStorage | Tag::YourPeerStorage => {
                self.reply(
                    key,
                    Tag::BadRequestReply,
                    &BadRequestReply {
                        reason: "peer-storage exchange does not run over this socket".to_string(),
                    },
                )?;
                Ok(false)
            }
            Tag::InitReply
            | Tag::ClientHsmFdReply
            | Tag::SignCommitmentTxReply
            | Tag::EcdhReply
            | Tag::BadRequestReply => {
                self.reply(
                    key,
                    Tag::BadRequestReply,
                    &BadRequestReply {
                        reason: "unexpected reply-typed frame from a client".to_string(),
                    },
                )?;
                Ok(false)
            }
        }
    }

    fn reply<T: serde::Serialize>(&mut self, key: ConnKey, tag: Tag, body: &T) -> Result<()> {
        let frame = Frame::new(tag, body)?;
        let stream = &mut self
            .table
            .get_mut(key)
            .expect("reply targets a live connection")
            .conn;
        frame.write_to(stream)?;
        Ok(())
    }

    fn close_conn(&mut self, key: ConnKey) {
        self.table.remove(key);
        debug!("conn {:?} closed", key);
    }
}

fn serve(config_path: &PathBuf) -> Result<i32> {
    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);
    ctrlc::set_handler(move || {
        info!("caught SIGINT, SIGTERM or SIGHUP, exiting");
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let config = NodeConfig::load(config_path)?;
    std::fs::create_dir_all(&config.data_dir)?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)?;
    info!("listening on {}", config.socket_path.display());

    let (master_stream, _) = listener.accept()?;
    info!("master connected");
    drop(listener);

    let mut dispatcher = Dispatcher::new(config.data_dir.clone(), master_stream)?;

    loop {
        if should_exit.load(Ordering::SeqCst) {
            return Ok(exit_code::CLEAN);
        }

        let mut pollfds = Vec::with_capacity(dispatcher.table.len());
        let mut keys = Vec::with_capacity(dispatcher.table.len());
        for (key, session) in dispatcher.table.iter() {
            pollfds.push(libc::pollfd {
                fd: session.conn.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            keys.push(key);
        }

        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        for (pollfd, &key) in pollfds.iter().zip(keys.iter()) {
            if pollfd.revents == 0 {
                continue;
            }

            // The connection may already have been closed by an earlier
            // iteration of this same loop (a forced session replacement
            // triggered from another ready fd): skip it rather than
            // panicking on a stale key.
            let Some(session) = dispatcher.table.get(key) else {
                continue;
            };
            let frame = Frame::read_from(&session.conn);

            match frame {
                Ok(Some(frame)) => match dispatcher.handle_frame(key, frame) {
                    Ok(true) => {}
                    Ok(false) => dispatcher.close_conn(key),
                    Err(e) => {
                        warn!("<{:?}> request handling error: {}", key, e);
                        dispatcher.close_conn(key);
                    }
                },
                Ok(None) => {
                    info!("<{:?}> session disconnected", key);
                    dispatcher.close_conn(key);
                }
                Err(e) => {
                    warn!("<{:?}> frame read error: {}", key, e);
                    dispatcher.close_conn(key);
                }
            }

            if !dispatcher.table.has_master() {
                info!("master session gone");
                return Ok(exit_code::MASTER_GONE);
            }
        }
    }
}
