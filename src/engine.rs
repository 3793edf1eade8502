// This module contains the server-side dispatcher and the per-client session driver.
//
// All traffic arrives on one UDP socket. The dispatcher parses each datagram and decides who
// should see it:
//
// 1. A read request creates a session keyed by the client's address and spawns a driver task
//    for it. The driver asks the gateway to open the file at the origin, listening for a client
//    abort meanwhile, then enters a phase of work and wait cycles: send a packet, wait for the
//    client to answer it or for the retransmission timer to expire.
// 2. Acks and errors are forwarded to the driver owning the client's address over a channel, so
//    one session's state is only ever touched by its own task.
// 3. Write requests are answered with an error on the spot. Anything else is dropped.
//
// A driver ends when its session reaches a terminal state, when the client aborts, when the
// retry budget runs out, or when a newer read request from the same address replaces it. Every
// one of those paths drops the session, and with it the origin body, through `ActiveSession`.

use crate::config::Config;
use crate::fetch::Body;
use crate::gateway::{reject_write, Gateway, WriteRequest};
use crate::session::{ResultAction, Session, SessionState};
use crate::tftp::{self, FileMode, Packet, RECV_BUFFER_SIZE};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Client packets queued for a busy session before further ones are dropped.
const SESSION_QUEUE: usize = 16;

type SessionTable = DashMap<SocketAddr, SessionHandle>;

/// The dispatcher's view of a running session.
struct SessionHandle {
    id: u64,
    filename: String,
    tx: mpsc::Sender<Packet>,
    task: Option<AbortHandle>,
    /// Set once the client has acknowledged anything.
    acked: Arc<AtomicBool>,
}

async fn send_error_packet(sock: &UdpSocket, dst: SocketAddr, packet: &Packet) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send_to(&packet.to_bytes(), dst).await;
}

/// Owns the listening socket and the table of active sessions.
pub struct Engine {
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    gateway: Arc<Gateway>,
    sessions: Arc<SessionTable>,
    next_id: AtomicU64,
}

impl Engine {
    pub async fn bind(config: Arc<Config>, gateway: Arc<Gateway>) -> Result<Engine> {
        let socket = UdpSocket::bind(&config.listen_addr)
            .await
            .with_context(|| format!("failed to bind TFTP socket on {}", config.listen_addr))?;

        Ok(Engine {
            socket: Arc::new(socket),
            config,
            gateway,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Receives and dispatches datagrams until the task is cancelled.
    pub async fn serve(&self) -> Result<()> {
        let mut buf = [0_u8; RECV_BUFFER_SIZE];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // Typically an ICMP error bounced back from a departed client.
                    log::debug!("recv_from failed: {e}");
                    continue;
                }
            };
            self.dispatch(&buf[..len], src).await;
        }
    }

    async fn dispatch(&self, buf: &[u8], src: SocketAddr) {
        let packet = match Packet::parse_from_buf(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("{src} - dropping malformed packet: {e}");
                return;
            }
        };

        match packet {
            Packet::ReadReq { path, mode, options } => {
                self.start_session(src, path, mode, options.contains_key("tsize"));
            }
            Packet::WriteReq { path, .. } => {
                let reply = reject_write(&WriteRequest { client: src }, &path);
                send_error_packet(&self.socket, src, &reply).await;
            }
            Packet::Ack { .. } | Packet::Error { .. } => self.route(src, packet),
            other => log::debug!("{src} - ignoring unexpected {:?} packet", other.opcode()),
        }
    }

    fn route(&self, src: SocketAddr, packet: Packet) {
        let Some(handle) = self.sessions.get(&src) else {
            log::debug!("{src} - no active transfer for {:?} packet", packet.opcode());
            return;
        };
        if handle.tx.try_send(packet).is_err() {
            log::debug!("{src} - session queue full, dropping packet");
        }
    }

    fn start_session(&self, client: SocketAddr, filename: String, mode: FileMode, tsize_requested: bool) {
        if let Some(existing) = self.sessions.get(&client) {
            // A retransmitted RRQ while the origin is still being contacted.
            if existing.filename == filename && !existing.acked.load(Ordering::Acquire) {
                log::debug!("{client} - ignoring duplicate RRQ '{filename}'");
                return;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let acked = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle { id, filename: filename.clone(), tx, task: None, acked: acked.clone() };

        // Registered before the driver starts, so its exit always finds its own entry.
        if let Some(previous) = self.sessions.insert(client, handle) {
            log::info!("{client} - new RRQ replaces transfer of '{}'", previous.filename);
            if let Some(task) = previous.task {
                task.abort();
            }
        }

        let session = Session::new(client, filename, self.config.tftp_retries)
            .with_tsize_requested(tsize_requested)
            .with_read_timeout(self.config.http_timeout);
        let driver = SessionDriver {
            socket: self.socket.clone(),
            gateway: self.gateway.clone(),
            sessions: self.sessions.clone(),
            id,
            client,
            timeout: self.config.tftp_timeout,
            acked,
        };
        let task = tokio::spawn(driver.run(session, mode, rx));

        if let Some(mut entry) = self.sessions.get_mut(&client) {
            if entry.id == id {
                entry.task = Some(task.abort_handle());
            }
        }
    }
}

/// A session plus its single finalization hook.
///
/// Dropping it, on any path including task abort, removes the table entry
/// (if still ours) and logs the outcome exactly once.
struct ActiveSession {
    session: Session<Body>,
    sessions: Arc<SessionTable>,
    id: u64,
    client: SocketAddr,
    started: Instant,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.sessions.remove_if(&self.client, |_, handle| handle.id == self.id);

        let bytes = self.session.bytes_sent();
        if bytes == 0 {
            return;
        }
        let filename = self.session.filename();
        match self.session.state() {
            SessionState::Completed => log::info!(
                "{} - completed RRQ '{}' bytes={} duration={:?}",
                self.client,
                filename,
                bytes,
                self.started.elapsed()
            ),
            state => log::warn!(
                "{} - ended RRQ '{}' as {:?} bytes={} duration={:?}",
                self.client,
                filename,
                state,
                bytes,
                self.started.elapsed()
            ),
        }
    }
}

/// Drives one session: sends, waits for the client or the timer, repeats.
struct SessionDriver {
    socket: Arc<UdpSocket>,
    gateway: Arc<Gateway>,
    sessions: Arc<SessionTable>,
    id: u64,
    client: SocketAddr,
    timeout: Duration,
    acked: Arc<AtomicBool>,
}

impl SessionDriver {
    async fn run(self, session: Session<Body>, mode: FileMode, mut rx: mpsc::Receiver<tftp::Packet>) {
        let mut active = ActiveSession {
            session,
            sessions: self.sessions.clone(),
            id: self.id,
            client: self.client,
            started: Instant::now(),
        };

        let filename = active.session.filename().to_string();
        // The client may abort while the origin is still answering. Dropping the fetch
        // future cancels the request.
        let opened = {
            let fetch = self.gateway.read_handler(&mut active.session, &filename, &mode);
            tokio::pin!(fetch);
            loop {
                tokio::select! {
                    opened = &mut fetch => break Ok(opened),
                    incoming = rx.recv() => match incoming {
                        Some(abort @ Packet::Error { .. }) => break Err(Some(abort)),
                        // Nothing was sent yet, so there is nothing to acknowledge.
                        Some(_) => continue,
                        None => break Err(None),
                    },
                }
            }
        };
        let mut action = match opened {
            Ok(Ok(body)) => active.session.start(body).await,
            Ok(Err(e)) => active.session.reject(e.to_packet()),
            Err(Some(abort)) => active.session.process_packet(&abort).await,
            // Replaced by a newer request before the origin answered.
            Err(None) => return,
        };

        loop {
            match action {
                ResultAction::SendPacketAndAwait(packet) => {
                    if let Err(e) = self.socket.send_to(&packet.to_bytes(), self.client).await {
                        log::warn!("{} - unable to send packet: {e}", self.client);
                        return;
                    }

                    // Only a send re-arms the timer; ignored packets keep the same deadline.
                    let deadline = Instant::now() + self.timeout;
                    action = loop {
                        match tokio::time::timeout_at(deadline, rx.recv()).await {
                            Ok(Some(incoming)) => match active.session.process_packet(&incoming).await {
                                ResultAction::RetryRecv => continue,
                                next => break next,
                            },
                            // The dispatcher dropped our handle.
                            Ok(None) => return,
                            Err(_) => {
                                log::debug!("{} - timed out waiting for ACK {}", self.client, active.session.block());
                                break active.session.on_timeout();
                            }
                        }
                    };

                    if active.session.blocks_acked() > 0 {
                        self.acked.store(true, Ordering::Release);
                    }
                }
                ResultAction::CloseConnection(maybe_warn) => {
                    if let Some(msg) = maybe_warn {
                        log::warn!("{} - {}", self.client, msg);
                    }
                    return;
                }
                ResultAction::TerminateWithPacket(packet) => {
                    send_error_packet(&self.socket, self.client, &packet).await;
                    return;
                }
                ResultAction::RetryRecv => {
                    log::error!("{} - session asked to wait before anything was sent", self.client);
                    return;
                }
            }
        }
    }
}
