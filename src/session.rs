//! The watch session: niconico's control channel for a broadcast.
//!
//! After `startWatching` the server announces, in any order, the comment room
//! (`room`) and the HLS playlist (`stream`). [`StreamSession`] records the first
//! of each and hands them to whoever is waiting.

use std::{fmt, future, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, Interval},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub message_server_uri: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAddress(pub String);

impl StreamAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    RoomEstablished,
    StreamReady,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Room,
    StreamAddress,
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::Room => f.write_str("room"),
            Milestone::StreamAddress => f.write_str("stream address"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Session closed while waiting for {awaited}")]
    SessionClosed { awaited: Milestone },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Control channel task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// What to ask for in `startWatching`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub quality: String,
    pub latency: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quality: "abr".to_string(),
            latency: "low".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeatData {
    keep_interval_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomData {
    message_server: MessageServer,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageServer {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    uri: String,
}

/// Follow-up the connection task has to perform after an inbound message.
#[derive(Debug, PartialEq, Eq)]
enum Directive {
    Reply(&'static str),
    KeepSeat(Duration),
}

const PONG: &str = r#"{"type":"pong"}"#;
const KEEP_SEAT: &str = r#"{"type":"keepSeat"}"#;

fn start_watching(config: &SessionConfig) -> String {
    json!({
        "type": "startWatching",
        "data": {
            "stream": {
                "quality": config.quality,
                "protocol": "hls",
                "latency": config.latency,
                "chasePlay": false,
            },
            "room": {
                "protocol": "webSocket",
                "commentable": true,
            },
            "reconnect": false,
        }
    })
    .to_string()
}

struct Inner {
    phase: Phase,
    room: Option<RoomHandle>,
    stream: Option<StreamAddress>,
    room_waiters: Vec<oneshot::Sender<RoomHandle>>,
    stream_waiters: Vec<oneshot::Sender<StreamAddress>>,
}

/// Milestones of one session, shared between the connection task and waiters.
///
/// Waiters hold a oneshot receiver; dropping the senders on close is what
/// fails them, so each waiter is resolved exactly once.
#[derive(Clone)]
struct SessionState {
    inner: Arc<Mutex<Inner>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Connecting,
                room: None,
                stream: None,
                room_waiters: Vec::new(),
                stream_waiters: Vec::new(),
            })),
        }
    }

    async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    /// Returns false if the event was a duplicate or arrived after close.
    async fn observe_room(&self, room: RoomHandle) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closed || inner.room.is_some() {
            return false;
        }

        if inner.phase == Phase::Connecting {
            inner.phase = Phase::RoomEstablished;
        }
        for waiter in inner.room_waiters.drain(..) {
            let _ = waiter.send(room.clone());
        }
        inner.room = Some(room);
        true
    }

    async fn observe_stream(&self, stream: StreamAddress) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closed || inner.stream.is_some() {
            return false;
        }

        inner.phase = Phase::StreamReady;
        for waiter in inner.stream_waiters.drain(..) {
            let _ = waiter.send(stream.clone());
        }
        inner.stream = Some(stream);
        true
    }

    async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closed {
            return false;
        }

        inner.phase = Phase::Closed;
        inner.room_waiters.clear();
        inner.stream_waiters.clear();
        true
    }

    async fn wait_room(&self) -> Result<RoomHandle, SessionError> {
        let closed = SessionError::SessionClosed {
            awaited: Milestone::Room,
        };
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.phase == Phase::Closed {
                return Err(closed);
            }
            if let Some(room) = &inner.room {
                return Ok(room.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.room_waiters.push(tx);
            rx
        };

        rx.await.map_err(|_| closed)
    }

    async fn wait_stream(&self) -> Result<StreamAddress, SessionError> {
        let closed = SessionError::SessionClosed {
            awaited: Milestone::StreamAddress,
        };
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.phase == Phase::Closed {
                return Err(closed);
            }
            if let Some(stream) = &inner.stream {
                return Ok(stream.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.stream_waiters.push(tx);
            rx
        };

        rx.await.map_err(|_| closed)
    }

    /// Apply one text frame from the control channel.
    async fn dispatch(&self, text: &str) -> Option<Directive> {
        let message: RawMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring malformed control message: {}", e);
                return None;
            }
        };

        match message.kind.as_str() {
            "ping" => Some(Directive::Reply(PONG)),
            "seat" => match serde_json::from_value::<SeatData>(message.data) {
                Ok(seat) => Some(Directive::KeepSeat(Duration::from_secs(
                    seat.keep_interval_sec.max(1),
                ))),
                Err(e) => {
                    warn!("Ignoring malformed seat message: {}", e);
                    None
                }
            },
            "room" => {
                match serde_json::from_value::<RoomData>(message.data) {
                    Ok(room) => {
                        let room = RoomHandle {
                            message_server_uri: room.message_server.uri,
                            thread_id: room.thread_id,
                        };
                        debug!("Room: {:?}", room);
                        if !self.observe_room(room).await {
                            debug!("Ignoring repeated room message");
                        }
                    }
                    Err(e) => warn!("Ignoring malformed room message: {}", e),
                }
                None
            }
            "stream" => {
                match serde_json::from_value::<StreamData>(message.data) {
                    Ok(stream) => {
                        debug!("Stream: {}", stream.uri);
                        if !self.observe_stream(StreamAddress(stream.uri)).await {
                            debug!("Ignoring repeated stream message");
                        }
                    }
                    Err(e) => warn!("Ignoring malformed stream message: {}", e),
                }
                None
            }
            "disconnect" => {
                info!("Server requested disconnect: {}", message.data);
                None
            }
            "error" => {
                error!("Control channel error: {}", message.data);
                None
            }
            other => {
                trace!("Ignoring {} message", other);
                None
            }
        }
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), SessionError>>,
}

/// A live connection to a broadcast's control channel.
pub struct StreamSession {
    state: SessionState,
    running: Mutex<Option<Running>>,
}

impl StreamSession {
    /// Start connecting to `url` in the background. Must be called from
    /// within a tokio runtime.
    pub fn connect(url: &str, config: SessionConfig) -> Self {
        let state = SessionState::new();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run_control_channel(
            url.to_string(),
            config,
            state.clone(),
            shutdown_rx,
        ));

        Self {
            state,
            running: Mutex::new(Some(Running { shutdown, task })),
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.phase().await
    }

    pub async fn await_room(&self) -> Result<RoomHandle, SessionError> {
        self.state.wait_room().await
    }

    pub async fn await_stream_address(&self) -> Result<StreamAddress, SessionError> {
        self.state.wait_stream().await
    }

    /// Close the session and wait for the connection task to finish.
    ///
    /// The first call returns the task's outcome; later calls do nothing.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.state.close().await;

        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(());

        running.task.await?
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

async fn tick(keep_seat: &mut Option<Interval>) {
    match keep_seat {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn run_control_channel(
    url: String,
    config: SessionConfig,
    state: SessionState,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), SessionError> {
    let result = control_channel_loop(&url, &config, &state, shutdown).await;
    state.close().await;

    match &result {
        Ok(()) => debug!("Control channel closed"),
        Err(e) => debug!("Control channel failed: {}", e),
    }
    result
}

async fn control_channel_loop(
    url: &str,
    config: &SessionConfig,
    state: &SessionState,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), SessionError> {
    let handshake = async {
        debug!("Connecting to control channel {}", url);
        let (mut ws, _) = connect_async(url).await?;
        info!("Connected to control channel");

        ws.send(Message::Text(start_watching(config))).await?;
        Ok::<_, SessionError>(ws)
    };

    let mut ws = tokio::select! {
        _ = &mut shutdown => {
            debug!("Control channel closed before the handshake finished");
            return Ok(());
        }
        ws = handshake => ws?,
    };

    let mut keep_seat: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = ws.close(None).await;
                return Ok(());
            }

            _ = tick(&mut keep_seat) => {
                trace!("Sending keepSeat");
                ws.send(Message::Text(KEEP_SEAT.to_string())).await?;
            }

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    trace!("Control message: {}", text);
                    match state.dispatch(&text).await {
                        Some(Directive::Reply(reply)) => {
                            ws.send(Message::Text(reply.to_string())).await?;
                        }
                        Some(Directive::KeepSeat(period)) => {
                            keep_seat = Some(interval_at(Instant::now() + period, period));
                        }
                        None => (),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Control channel closed by server: {:?}", frame);
                    return Ok(());
                }
                Some(Ok(_)) => (),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}
