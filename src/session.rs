use crate::gateway::OutgoingTransfer;
use crate::tftp::{self, ErrorCode, Packet, BLOCK_SIZE};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Lifecycle of one read transfer. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Transferring,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::TimedOut)
    }
}

/// Represents an action that the owner of a Session should take in
/// response to an event.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Send the packet and (re)arm the retransmission timer.
    SendPacketAndAwait(tftp::Packet),

    /// Close the session without sending anything, optionally logging a string.
    CloseConnection(Option<String>),

    /// Nothing changed; keep waiting against the timer already running.
    RetryRecv,

    /// Send the packet, which is never retransmitted, and close the session.
    TerminateWithPacket(tftp::Packet),
}

/// Server side of one RRQ: block numbering, ACK tracking and retransmission
/// bookkeeping over a forward-only byte source.
///
/// Block `n` always carries bytes `[(n-1)*512, n*512)` of the source. When
/// transfer size negotiation happens the OACK occupies block 0.
#[derive(Debug)]
pub struct Session<R> {
    client: SocketAddr,
    filename: String,
    tsize_requested: bool,
    declared_size: Option<u64>,
    /// Number of the last block sent.
    block: u16,
    bytes_sent: u64,
    last_sent: Option<Packet>,
    awaiting_ack: bool,
    final_block_sent: bool,
    blocks_acked: u64,
    retries: u32,
    max_retries: u32,
    read_timeout: Option<Duration>,
    state: SessionState,
    source: Option<R>,
}

impl<R: AsyncRead + Unpin> Session<R> {
    pub fn new(client: SocketAddr, filename: impl Into<String>, max_retries: u32) -> Session<R> {
        Session {
            client,
            filename: filename.into(),
            tsize_requested: false,
            declared_size: None,
            block: 0,
            bytes_sent: 0,
            last_sent: None,
            awaiting_ack: false,
            final_block_sent: false,
            blocks_acked: 0,
            retries: 0,
            max_retries,
            read_timeout: None,
            state: SessionState::AwaitingStart,
            source: None,
        }
    }

    /// The client asked for `tsize` in its RRQ.
    pub fn with_tsize_requested(mut self, requested: bool) -> Self {
        self.tsize_requested = requested;
        self
    }

    /// Bounds how long a single block read from the source may take.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    /// Count of ACKs that moved the transfer forward.
    pub fn blocks_acked(&self) -> u64 {
        self.blocks_acked
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Attaches the byte source and produces the first packet: an OACK carrying
    /// `tsize` when the client asked for it and the size is known, DATA 1 otherwise.
    pub async fn start(&mut self, source: R) -> ResultAction {
        if self.state != SessionState::AwaitingStart {
            return ResultAction::RetryRecv;
        }
        self.source = Some(source);
        self.state = SessionState::Transferring;

        match (self.tsize_requested, self.declared_size) {
            (true, Some(size)) => {
                let oack = Packet::OptionAck { options: vec![("tsize".to_string(), size.to_string())] };
                self.block = 0;
                ResultAction::SendPacketAndAwait(self.arm(oack))
            }
            _ => self.send_next_block().await,
        }
    }

    /// Ends a session that never started, answering the client with `packet`.
    pub fn reject(&mut self, packet: Packet) -> ResultAction {
        self.finish(SessionState::Failed);
        ResultAction::TerminateWithPacket(packet)
    }

    /// Given an incoming packet from the client, describes what to do next.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            &Packet::Ack { block } => self.on_ack(block).await,
            Packet::Error { code, message } => {
                self.finish(SessionState::Failed);
                ResultAction::CloseConnection(Some(format!(
                    "Client sent error packet: code: {:?}, message: '{}'",
                    code, message
                )))
            }
            // Stray DATA, OACK or requests never disturb a running transfer.
            _ => ResultAction::RetryRecv,
        }
    }

    pub async fn on_ack(&mut self, block: u16) -> ResultAction {
        // Acks for anything but the outstanding block are stale or duplicated.
        if self.state != SessionState::Transferring || !self.awaiting_ack || block != self.block {
            return ResultAction::RetryRecv;
        }
        self.awaiting_ack = false;
        self.blocks_acked += 1;

        if self.final_block_sent {
            self.finish(SessionState::Completed);
            return ResultAction::CloseConnection(None);
        }
        self.send_next_block().await
    }

    /// The retransmission timer expired without a matching ACK.
    pub fn on_timeout(&mut self) -> ResultAction {
        if self.state != SessionState::Transferring {
            return ResultAction::CloseConnection(None);
        }
        match self.last_sent.clone() {
            Some(packet) if self.retries < self.max_retries => {
                self.retries += 1;
                ResultAction::SendPacketAndAwait(packet)
            }
            _ => {
                let block = self.block;
                let retries = self.retries;
                self.finish(SessionState::TimedOut);
                ResultAction::CloseConnection(Some(format!("no ACK for block {block} after {retries} retries")))
            }
        }
    }

    pub fn on_source_error(&mut self, e: io::Error) -> ResultAction {
        self.finish(SessionState::Failed);
        ResultAction::TerminateWithPacket(Packet::error(
            ErrorCode::Undefined,
            format!("error reading from origin: {e}"),
        ))
    }

    async fn send_next_block(&mut self) -> ResultAction {
        let Some(source) = self.source.as_mut() else {
            return self.on_source_error(io::Error::new(io::ErrorKind::Other, "no data source"));
        };

        let read = match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read_block(source)).await {
                Ok(read) => read,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "origin stalled mid-transfer")),
            },
            None => read_block(source).await,
        };

        match read {
            Ok(data) => {
                self.block = self.block.wrapping_add(1);
                self.bytes_sent += data.len() as u64;
                if data.len() < BLOCK_SIZE {
                    self.final_block_sent = true;
                    // Drained; hand the connection back before the last ACK arrives.
                    self.source = None;
                }
                self.retries = 0;
                let packet = Packet::Data { block: self.block, data };
                ResultAction::SendPacketAndAwait(self.arm(packet))
            }
            Err(e) => self.on_source_error(e),
        }
    }

    fn arm(&mut self, packet: Packet) -> Packet {
        self.last_sent = Some(packet.clone());
        self.awaiting_ack = true;
        packet
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.awaiting_ack = false;
        self.source = None;
    }
}

impl<R> OutgoingTransfer for Session<R> {
    fn remote_addr(&self) -> SocketAddr {
        self.client
    }

    fn set_declared_size(&mut self, size: u64) {
        self.declared_size = Some(size);
    }
}

/// Reads until the block is full or the source ends.
async fn read_block<R: AsyncRead + Unpin>(source: &mut R) -> io::Result<Bytes> {
    let mut buf = vec![0_u8; BLOCK_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for, so keep reading into
    // the remainder of the buffer until it is full or the source hits EOF.
    while cursor < buf.len() {
        let n = source.read(&mut buf[cursor..]).await?;
        if n == 0 {
            break;
        }
        cursor += n;
    }
    buf.truncate(cursor);
    Ok(Bytes::from(buf))
}
