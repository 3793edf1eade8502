//! Glue between the TFTP engine and the HTTP origin.
//!
//! The engine hands each transfer to the gateway through two small capability
//! traits, so the gateway never needs to know what concrete session type it is
//! talking to.

use std::net::SocketAddr;
use thiserror::Error;

use crate::fetch::{Body, FetchError, HttpFetcher};
use crate::tftp::{ErrorCode, FileMode, Packet};

/// A transfer the server sends data on.
pub trait OutgoingTransfer {
    fn remote_addr(&self) -> SocketAddr;

    /// Records the total size announced by the origin.
    fn set_declared_size(&mut self, size: u64);
}

/// A transfer the client would send data on.
pub trait IncomingTransfer {
    fn remote_addr(&self) -> SocketAddr;
}

/// A write request as seen by the rejector.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    pub client: SocketAddr,
}

impl IncomingTransfer for WriteRequest {
    fn remote_addr(&self) -> SocketAddr {
        self.client
    }
}

/// Why a read request could not be started.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("transfer mode '{0}' is not supported, use octet")]
    UnsupportedMode(FileMode),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ReadError {
    /// The ERROR packet the client receives for this failure.
    pub fn to_packet(&self) -> Packet {
        match self {
            ReadError::UnsupportedMode(_) => Packet::error(ErrorCode::Illegal, self.to_string()),
            ReadError::Fetch(FetchError::NotFound) => Packet::error(ErrorCode::FileNotFound, "File not found"),
            ReadError::Fetch(e) => Packet::error(ErrorCode::Undefined, e.to_string()),
        }
    }
}

/// Resolves read requests against the origin.
#[derive(Debug, Clone)]
pub struct Gateway {
    fetcher: HttpFetcher,
}

impl Gateway {
    pub fn new(fetcher: HttpFetcher) -> Gateway {
        Gateway { fetcher }
    }

    /// Opens the origin body for `filename` and records its declared size on `transfer`.
    pub async fn read_handler<T: OutgoingTransfer>(
        &self,
        transfer: &mut T,
        filename: &str,
        mode: &FileMode,
    ) -> Result<Body, ReadError> {
        let from = transfer.remote_addr();
        log::info!("{from} - received RRQ '{filename}'");

        if *mode != FileMode::Octet {
            log::warn!("{from} - refusing RRQ '{filename}' in {mode} mode");
            return Err(ReadError::UnsupportedMode(mode.clone()));
        }

        let result = self.fetcher.fetch(filename, from).await.map_err(|e| {
            if !matches!(e, FetchError::NotFound) {
                log::warn!("{from} - error on HTTP GET: {e}");
            }
            e
        })?;

        log::debug!("{from} - origin answered {} for '{filename}'", result.status);
        if let Some(size) = result.content_length {
            transfer.set_declared_size(size);
        }
        Ok(result.body)
    }
}

/// Answers every WRQ with an access violation. Stateless.
pub fn reject_write<T: IncomingTransfer>(transfer: &T, filename: &str) -> Packet {
    log::info!("{} - received unsupported WRQ '{}'", transfer.remote_addr(), filename);
    Packet::error(ErrorCode::AccessViolation, "put is unsupported")
}
