//! Shared fixtures: an in-process HTTP/1.1 origin, a minimal TFTP client and a
//! helper that starts the gateway on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tftp_http_gateway::config::Config;
use tftp_http_gateway::engine::Engine;
use tftp_http_gateway::fetch::HttpFetcher;
use tftp_http_gateway::gateway::Gateway;
use tftp_http_gateway::tftp::{FileMode, Packet};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

/// How the origin answers a path.
#[derive(Debug, Clone)]
pub enum Route {
    /// 200 with Content-Length.
    Body(Vec<u8>),
    /// 200 delimited by connection close, no declared length.
    Unsized(Vec<u8>),
    /// Declares `declared` bytes but sends only the given prefix before closing.
    Truncated { declared: usize, sent: Vec<u8> },
    /// Empty response with this status.
    Status(u16),
    /// 200 with Content-Length, sent only after `delay`.
    Delayed { delay: Duration, body: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
}

pub struct Origin {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl Origin {
    pub async fn spawn(routes: Vec<(&str, Route)>) -> Origin {
        let routes: Arc<HashMap<String, Route>> =
            Arc::new(routes.into_iter().map(|(path, route)| (path.to_string(), route)).collect());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(serve_one(stream, routes.clone(), log.clone()));
            }
        });

        Origin { addr, seen }
    }

    /// Base URL with a trailing slash, ready to have filenames appended.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn serve_one(stream: TcpStream, routes: Arc<HashMap<String, Route>>, seen: Arc<Mutex<Vec<SeenRequest>>>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
    }
    let path = line.split_whitespace().nth(1).unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    seen.lock().unwrap().push(SeenRequest { path: path.clone(), headers });

    let mut response = Vec::new();
    match routes.get(&path) {
        Some(Route::Body(body)) => {
            response.extend_from_slice(
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes(),
            );
            response.extend_from_slice(body);
        }
        Some(Route::Unsized(body)) => {
            response.extend_from_slice(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
            response.extend_from_slice(body);
        }
        Some(Route::Truncated { declared, sent }) => {
            response.extend_from_slice(
                format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n").as_bytes(),
            );
            response.extend_from_slice(sent);
        }
        Some(Route::Status(code)) => {
            response.extend_from_slice(
                format!("HTTP/1.1 {code} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").as_bytes(),
            );
        }
        Some(Route::Delayed { delay, body }) => {
            tokio::time::sleep(*delay).await;
            response.extend_from_slice(
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes(),
            );
            response.extend_from_slice(body);
        }
        None => {
            response.extend_from_slice(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        }
    }

    let mut stream = reader.into_inner();
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}

/// Starts a gateway on 127.0.0.1 with an ephemeral port and serves it in the background.
pub async fn start_gateway(origin_url: &str, tftp_timeout: Duration, tftp_retries: u32) -> Arc<Engine> {
    let config = Arc::new(Config {
        listen_addr: "127.0.0.1:0".to_string(),
        http_url: origin_url.to_string(),
        http_timeout: Duration::from_secs(2),
        http_max_idle: 4,
        tftp_timeout,
        tftp_retries,
    });
    let gateway = Arc::new(Gateway::new(HttpFetcher::new(&config).unwrap()));
    let engine = Arc::new(Engine::bind(config, gateway).await.unwrap());

    let serving = engine.clone();
    tokio::spawn(async move { serving.serve().await });
    engine
}

/// Polls until the engine has no sessions left or two seconds pass.
pub async fn wait_for_idle(engine: &Engine) -> usize {
    for _ in 0..200 {
        if engine.active_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.active_sessions()
}

/// Outcome of a client-driven read.
#[derive(Debug)]
pub struct Download {
    pub data: Vec<u8>,
    pub blocks: Vec<u16>,
    pub block_sizes: Vec<usize>,
}

pub struct TftpClient {
    pub sock: UdpSocket,
    pub server: SocketAddr,
}

impl TftpClient {
    pub async fn new(server: SocketAddr) -> TftpClient {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        TftpClient { sock, server }
    }

    pub fn addr(&self) -> SocketAddr {
        self.sock.local_addr().unwrap()
    }

    pub async fn send(&self, packet: &Packet) {
        self.sock.send_to(&packet.to_bytes(), self.server).await.unwrap();
    }

    pub async fn rrq(&self, path: &str, mode: FileMode, options: &[(&str, &str)]) {
        let options = options.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.send(&Packet::ReadReq { path: path.to_string(), mode, options }).await;
    }

    pub async fn ack(&self, block: u16) {
        self.send(&Packet::Ack { block }).await;
    }

    /// Next packet from the server, or `None` if nothing arrives within `wait`.
    pub async fn recv_within(&self, wait: Duration) -> Option<Packet> {
        let mut buf = [0_u8; 1500];
        match timeout(wait, self.sock.recv_from(&mut buf)).await {
            Ok(Ok((n, src))) => {
                assert_eq!(src, self.server, "reply must come from the listening port");
                Some(Packet::parse_from_buf(&buf[..n]).unwrap())
            }
            Ok(Err(e)) => panic!("recv failed: {e}"),
            Err(_) => None,
        }
    }

    pub async fn recv(&self) -> Packet {
        self.recv_within(Duration::from_secs(3)).await.expect("no packet from server")
    }

    /// Acks every DATA block until the short one arrives. Errors are returned as packets.
    pub async fn download(&self, path: &str) -> Result<Download, Packet> {
        self.rrq(path, FileMode::Octet, &[]).await;
        self.collect(1).await
    }

    /// Receives DATA starting at block `first` and acks each one.
    pub async fn collect(&self, first: u16) -> Result<Download, Packet> {
        let mut download = Download { data: Vec::new(), blocks: Vec::new(), block_sizes: Vec::new() };
        let mut expected = first;
        loop {
            match self.recv().await {
                Packet::Data { block, data } => {
                    assert_eq!(block, expected, "blocks must arrive in order");
                    download.data.extend_from_slice(&data);
                    download.blocks.push(block);
                    download.block_sizes.push(data.len());
                    self.ack(block).await;
                    if data.len() < 512 {
                        return Ok(download);
                    }
                    expected = expected.wrapping_add(1);
                }
                error @ Packet::Error { .. } => return Err(error),
                other => panic!("unexpected packet {:?}", other),
            }
        }
    }
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
