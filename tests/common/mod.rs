// Scripted HTTP/1.1 server on a loopback socket, shared by the integration tests
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// What the server does with one request
pub enum Reply {
    /// Write the bytes and keep the connection open for the next request
    Respond(Vec<u8>),
    /// Write the bytes, then close the connection
    RespondAndClose(Vec<u8>),
    /// Never answer; hold the connection until the client closes it
    Hang,
    /// Write `now`, wait `delay`, then write `later` and keep serving the connection
    Staggered {
        now: Vec<u8>,
        delay: Duration,
        later: Vec<u8>,
    },
}

type Handler = Arc<dyn Fn(usize, &str) -> Reply + Send + Sync>;

pub struct ScriptedServer {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    /// Start a server. `handler` gets the zero-based connection index and the raw request head.
    pub async fn start(handler: impl Fn(usize, &str) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let accepted = connections.clone();
        let recorded = heads.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    socket,
                    index,
                    handler.clone(),
                    recorded.clone(),
                ));
            }
        });

        Self {
            addr,
            connections,
            heads,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request heads received so far, in arrival order
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().unwrap().clone()
    }

    /// Wait until at least `count` requests have arrived
    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..200 {
            if self.heads().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server saw {} request(s), expected {count}", self.heads().len());
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    index: usize,
    handler: Handler,
    heads: Arc<Mutex<Vec<String>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let end = loop {
            if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break at + 4;
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        buf.drain(..end);

        let length = content_length(&head);
        while buf.len() < length {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        buf.drain(..length);
        heads.lock().unwrap().push(head.clone());

        match handler(index, &head) {
            Reply::Respond(bytes) => {
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Reply::RespondAndClose(bytes) => {
                let _ = socket.write_all(&bytes).await;
                return;
            }
            Reply::Staggered { now, delay, later } => {
                if socket.write_all(&now).await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
                if socket.write_all(&later).await.is_err() {
                    return;
                }
            }
            Reply::Hang => {
                while let Ok(n) = socket.read(&mut chunk).await {
                    if n == 0 {
                        return;
                    }
                }
                return;
            }
        }
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Request path of a raw request head
pub fn path(head: &str) -> &str {
    head.split_whitespace().nth(1).unwrap_or("")
}

pub fn ok(body: &str) -> Vec<u8> {
    response(200, "OK", &[], body)
}

pub fn response(status: u16, message: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {message}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out.into_bytes()
}
