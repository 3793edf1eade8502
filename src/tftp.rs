use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Payload size of a full DATA block. A shorter block ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Large enough for any request a client may send, options included.
pub const RECV_BUFFER_SIZE: usize = 1500;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a datagram that could not be understood as a TFTP packet.
#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown opcode retrieved: {0}")]
    UnknownOpcode(u16),

    #[error("request does not contain a null-terminated {0}")]
    Unterminated(&'static str),
}

type PacketResult<T> = Result<T, PacketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
    /// Anything a client sent that RFC 1350 does not name.
    Other(String),
}

impl FileMode {
    fn parse(raw: &str) -> FileMode {
        match raw.to_lowercase().as_str() {
            "netascii" => FileMode::NetAscii,
            "octet" => FileMode::Octet,
            "mail" => FileMode::Mail,
            _ => FileMode::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
            FileMode::Other(raw) => raw,
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// Utility enum for the two-byte header every TFTP packet starts with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    /// Option acknowledgment, RFC 2347.
    Oack = 6,
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// RFC 2347 options, names lowercased.
        options: HashMap<String, String>,
    },

    /// A write request packet
    WriteReq { path: String, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Bytes,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },

    /// Accepted options, echoed back in the order given.
    OptionAck { options: Vec<(String, String)> },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given, or `None` if no 0 byte was encountered.
fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((buf[..end].iter().map(|&c| char::from(c)).collect(), end))
}

fn retrieve_op_code(buf: &[u8]) -> PacketResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => Err(PacketError::UnknownOpcode(rawcode)),
    }
}

/// Parses `path\0mode\0` and returns the remainder of the buffer after the mode terminator.
fn parse_path_and_mode(buf: &[u8]) -> PacketResult<(String, FileMode, &[u8])> {
    let (path, path_end) = string_from_buffer(buf).ok_or(PacketError::Unterminated("path"))?;
    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest).ok_or(PacketError::Unterminated("mode"))?;

    Ok((path, FileMode::parse(&raw_mode), &rest[mode_end + 1..]))
}

/// Reads `name\0value\0` pairs. A trailing incomplete pair is dropped, as are empty names.
fn parse_options(mut buf: &[u8]) -> HashMap<String, String> {
    let mut options = HashMap::new();
    while let Some((name, name_end)) = string_from_buffer(buf) {
        let Some((value, value_end)) = string_from_buffer(&buf[name_end + 1..]) else {
            break;
        };
        if !name.is_empty() {
            options.insert(name.to_lowercase(), value);
        }
        buf = &buf[name_end + 1 + value_end + 1..];
    }
    options
}

fn parse_read_req(buf: &[u8]) -> PacketResult<Packet> {
    let (path, mode, rest) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode, options: parse_options(rest) })
}

fn parse_write_req(buf: &[u8]) -> PacketResult<Packet> {
    let (path, mode, _) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> PacketResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Bytes::copy_from_slice(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> PacketResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> PacketResult<Packet> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    // Some clients omit the terminator; take whatever text is there.
    let message = match string_from_buffer(&buf[4..]) {
        Some((message, _)) => message,
        None => buf[4..].iter().map(|&c| char::from(c)).collect(),
    };
    Ok(Packet::Error { code, message })
}

fn parse_oack(buf: &[u8]) -> PacketResult<Packet> {
    let mut options: Vec<_> = parse_options(&buf[2..]).into_iter().collect();
    options.sort();
    Ok(Packet::OptionAck { options })
}

fn put_str(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> PacketResult<Packet> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort(buf.len()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Oack => parse_oack(buf),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    /// Encodes the packet in network byte order, ready for `send_to`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + BLOCK_SIZE);
        out.put_u16(self.opcode() as u16);
        match self {
            Packet::ReadReq { path, mode, options } => {
                put_str(&mut out, path);
                put_str(&mut out, mode.as_str());
                for (name, value) in options {
                    put_str(&mut out, name);
                    put_str(&mut out, value);
                }
            }
            Packet::WriteReq { path, mode } => {
                put_str(&mut out, path);
                put_str(&mut out, mode.as_str());
            }
            Packet::Data { block, data } => {
                out.put_u16(*block);
                out.put_slice(data);
            }
            Packet::Ack { block } => out.put_u16(*block),
            Packet::Error { code, message } => {
                out.put_u16(code.as_u16());
                put_str(&mut out, message);
            }
            Packet::OptionAck { options } => {
                for (name, value) in options {
                    put_str(&mut out, name);
                    put_str(&mut out, value);
                }
            }
        }
        out.freeze()
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error { code, message: message.into() }
    }
}
