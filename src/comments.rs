//! Comment capture from a broadcast's message server.
//!
//! Every `chat` object the server pushes is written to a JSON lines file as
//! it arrives.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::{
    fs::File,
    io::{self, AsyncWriteExt},
    net::TcpStream,
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::session::RoomHandle;

const COMMENT_PROTOCOL: &str = "msg.nicovideo.jp#json";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
const THREAD_VERSION: &str = "20061206";
const RES_FROM: i64 = -150;

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Comment capture task failed")]
    Task(#[from] tokio::task::JoinError),
    #[error("Closed before the message server connection was up")]
    NotConnected,
}

/// Append-only JSON lines file, flushed after every record.
pub struct CommentLog {
    file: File,
    written: u64,
}

impl CommentLog {
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self { file, written: 0 })
    }

    pub async fn append(&mut self, record: &str) -> io::Result<()> {
        let mut line = String::with_capacity(record.len() + 1);
        line.push_str(record);
        line.push('\n');

        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Returns the line to persist for a frame, if it carries a comment.
fn comment_record(text: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring malformed comment message: {}", e);
            return None;
        }
    };
    value.get("chat")?;

    // Keep the server's text unless it would break the one-record-per-line layout
    let text = text.trim();
    if text.contains('\n') {
        Some(value.to_string())
    } else {
        Some(text.to_string())
    }
}

fn thread_request(room: &RoomHandle) -> String {
    json!([
        { "ping": { "content": "rs:0" } },
        { "ping": { "content": "ps:0" } },
        {
            "thread": {
                "thread": room.thread_id,
                "version": THREAD_VERSION,
                "user_id": "guest",
                "res_from": RES_FROM,
                "with_global": 1,
                "scores": 1,
                "nicoru": 0
            }
        },
        { "ping": { "content": "pf:0" } },
        { "ping": { "content": "rf:0" } }
    ])
    .to_string()
}

/// Write every comment from `messages` to `log` until the stream ends or a
/// close frame arrives. Returns the number of comments written.
async fn pump<S>(mut messages: S, log: &mut CommentLog) -> Result<u64, CaptureError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = messages.next().await {
        match message? {
            Message::Text(text) => {
                if let Some(record) = comment_record(&text) {
                    log.append(&record).await?;
                }
            }
            Message::Close(_) => break,
            _ => (),
        }
    }

    Ok(log.written())
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<u64, CaptureError>>,
}

pub struct CommentCapture {
    destination: PathBuf,
    running: Mutex<Option<Running>>,
}

impl CommentCapture {
    /// Start capturing comments from the room's message server into
    /// `destination` in the background. Returns immediately; connection
    /// failures are reported by [`CommentCapture::close`]. The file is only
    /// created once the connection is up.
    pub fn start(room: &RoomHandle, destination: &Path) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(capture_comments(
            room.clone(),
            destination.to_path_buf(),
            shutdown_rx,
        ));

        Self {
            destination: destination.to_path_buf(),
            running: Mutex::new(Some(Running { shutdown, task })),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Stop capturing. The first call returns the number of comments saved;
    /// later calls return `None`.
    pub async fn close(&self) -> Result<Option<u64>, CaptureError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(None);
        };
        let _ = running.shutdown.send(());

        let written = running.task.await??;
        info!(
            "Saved {} comments to {}",
            written,
            self.destination.display()
        );
        Ok(Some(written))
    }
}

impl Drop for CommentCapture {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

type MessageStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(
    room: &RoomHandle,
    destination: &Path,
) -> Result<(MessageStream, CommentLog), CaptureError> {
    let mut request = room.message_server_uri.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(COMMENT_PROTOCOL));

    debug!("Connecting to message server {}", room.message_server_uri);
    let (mut ws, _) = connect_async(request).await?;
    ws.send(Message::Text(thread_request(room))).await?;

    let log = CommentLog::create(destination).await?;
    info!("Saving comments to {}", destination.display());

    Ok((ws, log))
}

async fn capture_comments(
    room: RoomHandle,
    destination: PathBuf,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<u64, CaptureError> {
    let (ws, mut log) = tokio::select! {
        _ = &mut shutdown => return Err(CaptureError::NotConnected),
        opened = open(&room, &destination) => opened?,
    };
    let (mut sink, stream) = ws.split();

    let keep_alive = async {
        let mut interval = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = sink.send(Message::Text(String::new())).await {
                return Err::<u64, _>(CaptureError::from(e));
            }
        }
    };

    tokio::select! {
        result = pump(stream, &mut log) => result,
        result = keep_alive => result,
        _ = &mut shutdown => Ok(log.written()),
    }
}
