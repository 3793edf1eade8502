// TFTP to HTTP gateway. Read requests (RFC 1350) are answered with the body of an HTTP GET
// against a configured origin.
//
// Transfer begins with a request to read a file. The server answers on the same port with DATA
// blocks of 512 bytes, each of which must be acked before the next one is sent. A block shorter
// than 512 bytes (possibly empty) ends the transfer.
//
// On data loss the server times out and retransmits the last packet, up to a bounded number of
// times. Most errors terminate the transfer with an ERROR packet, which is a courtesy: it is
// neither acked nor retransmitted.
//
// Error codes used here:
//
// 0    Not defined, see msg (origin unreachable, unexpected status, broken body)
// 1    File not found (origin answered 404)
// 2    Access violation (any write request)
// 4    Illegal TFTP op (transfer mode other than octet)
//
// Configuration is read from the environment, see `config::usage`.

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tftp_http_gateway::config::{self, Config};
use tftp_http_gateway::engine::Engine;
use tftp_http_gateway::fetch::HttpFetcher;
use tftp_http_gateway::gateway::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            println!("Error parsing environment variables:\n{e}\n");
            print!("{}", config::usage());
            process::exit(1);
        }
    };

    let fetcher = HttpFetcher::new(&config).context("failed to build HTTP client")?;
    let gateway = Arc::new(Gateway::new(fetcher));
    let engine = Engine::bind(config.clone(), gateway).await?;

    log::info!(
        "proxying TFTP requests on {} to {}",
        engine.local_addr().context("failed to read local address")?,
        config.http_url
    );

    tokio::select! {
        served = engine.serve() => served.context("Starting TFTP server failed"),
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, shutting down with {} active transfers", engine.active_sessions());
            Ok(())
        }
    }
}
