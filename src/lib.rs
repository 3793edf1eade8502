//! A TFTP server that serves every read request from an HTTP origin.
//!
//! A client's RRQ for `name` becomes `GET <HTTP_URL>name`; the response body is
//! streamed back in 512-byte DATA blocks, one ACK at a time (RFC 1350). Write
//! requests are always refused. When the client asks for `tsize` and the origin
//! declares a Content-Length, the size is advertised in an OACK (RFC 2349).
//!
//! - [`config`] reads and validates the environment.
//! - [`fetch`] performs the upstream GET.
//! - [`tftp`] parses and encodes packets.
//! - [`session`] is the per-transfer state machine.
//! - [`gateway`] maps read and write requests onto the origin.
//! - [`engine`] owns the socket and runs one task per client.

pub mod config;
pub mod engine;
pub mod fetch;
pub mod gateway;
pub mod session;
pub mod tftp;
