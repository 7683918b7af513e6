//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

#[derive(Clone, Debug)]
enum Command {
    Push(String),
    Close(u16),
}

/// A WebSocket backend on an ephemeral port that echoes text frames,
/// records what it received and can push or close on demand.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub closes: Arc<Mutex<Vec<u16>>>,
    commands: broadcast::Sender<Command>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(Vec::new()));
        let (commands, _) = broadcast::channel(16);

        let accept_task = {
            let accepted = accepted.clone();
            let received = received.clone();
            let closes = closes.clone();
            let commands = commands.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                        continue;
                    };
                    let commands = commands.subscribe();
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(ws, received.clone(), closes.clone(), commands));
                }
            })
        };

        Self {
            addr,
            accepted,
            received,
            closes,
            commands,
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Close codes received from clients, in arrival order.
    pub fn closes(&self) -> Vec<u16> {
        self.closes.lock().unwrap().clone()
    }

    /// Send a text frame on every open connection.
    pub fn push(&self, text: &str) {
        let _ = self.commands.send(Command::Push(text.to_string()));
    }

    /// Close every open connection with `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.commands.send(Command::Close(code));
    }

    /// Stop accepting new connections; existing ones stay open.
    ///
    /// Returns once the listening socket is closed.
    pub async fn stop_accepting(&self) {
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    received: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<Vec<u16>>>,
    mut commands: broadcast::Receiver<Command>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    received.lock().unwrap().push(text.as_str().to_owned());
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        closes.lock().unwrap().push(u16::from(frame.code));
                    }
                    break;
                }
                Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(Command::Push(text)) => {
                    if write.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Command::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "closed by test".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                Err(_) => break,
            },
        }
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
