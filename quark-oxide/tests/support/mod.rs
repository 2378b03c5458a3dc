//! In-process mock RESP server for end-to-end tests.
//!
//! Each accepted connection gets an index; the script closure decides per
//! command what to do. Commands are recorded for later assertions.

#![allow(dead_code)]

use quark_oxide::protocol::{ParseOutcome, RespEncoder, ResponseParser};
use quark_oxide::{Members, RespValue};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// What the server does with one incoming command.
pub enum Action {
    /// Write the reply immediately
    Reply(RespValue),
    /// Wait for a permit on the semaphore, then write the reply
    Gated(Arc<Semaphore>, RespValue),
    /// Write nothing
    Silent,
    /// Drop the connection without replying
    Close,
}

/// (connection index, command index within the connection, command args)
pub type Script = Arc<dyn Fn(usize, usize, &[Vec<u8>]) -> Action + Send + Sync>;

/// Everything every connection received, in arrival order.
#[derive(Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<(usize, Vec<Vec<u8>>)>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, conn: usize, args: &[Vec<u8>]) {
        self.entries.lock().unwrap().push((conn, args.to_vec()));
    }

    pub fn snapshot(&self) -> Vec<(usize, Vec<Vec<u8>>)> {
        self.entries.lock().unwrap().clone()
    }

    /// Commands received on the given connection, as lossy strings.
    pub fn commands_on(&self, conn: usize) -> Vec<Vec<String>> {
        self.snapshot()
            .into_iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, args)| {
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect()
            })
            .collect()
    }

    pub fn total(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub struct MockServer {
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, conn, script.clone()));
            }
        });

        Self { addr, accept_task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn members(&self) -> Members {
        Members::new("127.0.0.1", self.addr.port())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, conn: usize, script: Script) {
    let mut parser = ResponseParser::new();
    let mut buf = [0u8; 8192];
    let mut cmd_index = 0usize;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        parser.feed(&buf[..n]);

        loop {
            match parser.try_pull() {
                ParseOutcome::Incomplete => break,
                ParseOutcome::ProtocolError(_) => return,
                ParseOutcome::Complete(value) => {
                    let args = command_args(&value);
                    let action = script(conn, cmd_index, &args);
                    cmd_index += 1;
                    match action {
                        Action::Reply(reply) => {
                            let bytes = RespEncoder::encode_to_bytes(&reply);
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Action::Gated(gate, reply) => {
                            let permit = gate.acquire().await;
                            permit.unwrap().forget();
                            let bytes = RespEncoder::encode_to_bytes(&reply);
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Action::Silent => {}
                        Action::Close => return,
                    }
                }
            }
        }
    }
}

fn command_args(value: &RespValue) -> Vec<Vec<u8>> {
    match value {
        RespValue::Array(items) => items
            .iter()
            .map(|item| match item {
                RespValue::BulkString(b) => b.to_vec(),
                RespValue::SimpleString(s) => s.as_bytes().to_vec(),
                other => format!("{other:?}").into_bytes(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Lossy string view of one command's args.
pub fn args_as_strings(args: &[Vec<u8>]) -> Vec<String> {
    args.iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect()
}

pub fn ok() -> RespValue {
    RespValue::SimpleString("OK".into())
}

pub fn bulk(text: impl AsRef<[u8]>) -> RespValue {
    RespValue::BulkString(bytes::Bytes::copy_from_slice(text.as_ref()))
}
