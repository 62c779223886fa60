use crate::config::ReconnectPolicy;
use crate::push::frame::{Command, Frame, FrameError};
use crate::push::registry::{PushDelivery, PushHandler, TopicRegistry};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Supplies the access token presented on every (re)connect.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PushError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid STOMP frame: {0}")]
    Frame(#[from] FrameError),
    #[error("broker rejected the connection: {0}")]
    Rejected(String),
    #[error("broker did not answer CONNECT in time")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug)]
enum ChannelCommand {
    Subscribe { topic: String, id: String },
    Unsubscribe { id: String },
    Close,
}

struct Shared {
    registry: TopicRegistry,
    state: watch::Sender<ConnectionState>,
}

/// Shared STOMP connection multiplexing every push topic.
///
/// The connection is owned by a background task; handles only talk to it
/// through a command queue, so cloning the channel is cheap.
#[derive(Clone)]
pub struct PushChannel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PushChannel {
    /// Starts connecting in the background. Must be called inside a tokio runtime.
    pub fn open(url: Url, policy: ReconnectPolicy, token: TokenSource) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            registry: TopicRegistry::default(),
            state,
        });
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            Arc::clone(&shared),
            url,
            policy,
            token,
            receiver,
        ));
        Self {
            shared,
            commands,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Registers `handler` for `topic`. The broker subscription is created for
    /// the first handler and survives reconnects until the last one leaves.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(PushDelivery) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let handler: PushHandler = Arc::new(handler);
        let (handler_id, announce) = self.shared.registry.add(&topic, handler);
        if let Some(id) = announce {
            debug!(target: "prodsync::push", topic = %topic, id = %id, "subscribing");
            let _ = self.commands.send(ChannelCommand::Subscribe {
                topic: topic.clone(),
                id,
            });
        }
        Subscription {
            topic,
            handler_id,
            shared: Arc::clone(&self.shared),
            commands: self.commands.clone(),
            active: true,
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.shared.registry.handler_count(topic)
    }

    /// Sends DISCONNECT and waits for the connection task to finish.
    pub async fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: "prodsync::push", error = %err, "push connection task ended abnormally");
            }
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }
}

/// Keeps a handler registered; dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    handler_id: u64,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(id) = self.shared.registry.remove(&self.topic, self.handler_id) {
            debug!(target: "prodsync::push", topic = %self.topic, id = %id, "unsubscribing");
            let _ = self.commands.send(ChannelCommand::Unsubscribe { id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

enum SessionEnd {
    Closed,
    Dropped(String),
}

async fn run_connection(
    shared: Arc<Shared>,
    url: Url,
    policy: ReconnectPolicy,
    token: TokenSource,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    let mut attempt: u32 = 0;
    loop {
        match handshake(&url, token().as_deref()).await {
            Ok(socket) => {
                attempt = 0;
                shared.state.send_replace(ConnectionState::Connected);
                info!(target: "prodsync::push", url = %url, "push channel connected");
                match drive(socket, &shared, &mut commands).await {
                    SessionEnd::Closed => break,
                    SessionEnd::Dropped(reason) => {
                        warn!(target: "prodsync::push", reason = %reason, "push connection dropped");
                    }
                }
            }
            Err(err) => {
                warn!(target: "prodsync::push", attempt, error = %err, "push connect failed");
            }
        }

        attempt = attempt.saturating_add(1);
        shared
            .state
            .send_replace(ConnectionState::Reconnecting { attempt });
        let delay = policy.delay_for(attempt);
        debug!(target: "prodsync::push", attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        if !backoff(delay, &mut commands).await {
            break;
        }
    }
    shared.state.send_replace(ConnectionState::Closed);
    debug!(target: "prodsync::push", "push connection task finished");
}

/// Sleeps for `delay` while draining commands. Subscription changes need no
/// action here since the registry is replayed on reconnect. Returns `false`
/// when the channel was closed.
async fn backoff(delay: Duration, commands: &mut mpsc::UnboundedReceiver<ChannelCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                None | Some(ChannelCommand::Close) => return false,
                Some(_) => continue,
            },
        }
    }
}

async fn handshake(url: &Url, token: Option<&str>) -> Result<Socket, PushError> {
    let (mut socket, _) = connect_async(url.as_str()).await?;

    let mut connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", url.host_str().unwrap_or("localhost"))
        .header("heart-beat", "0,0");
    if let Some(token) = token {
        connect = connect.header("Authorization", format!("Bearer {token}"));
    }
    socket.send(Message::Text(connect.encode())).await?;

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(message) = socket.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Close(_) => return Err(PushError::Closed),
                _ => continue,
            };
            for frame in Frame::parse_all(&text)? {
                match frame.command {
                    Command::Connected => return Ok(()),
                    Command::Error => {
                        let reason = frame.get("message").unwrap_or(frame.body.as_str());
                        return Err(PushError::Rejected(reason.to_string()));
                    }
                    _ => {}
                }
            }
        }
        Err::<(), PushError>(PushError::Closed)
    })
    .await;

    match connected {
        Ok(Ok(())) => Ok(socket),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(PushError::HandshakeTimeout),
    }
}

fn subscribe_frame(topic: &str, id: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", topic)
        .header("ack", "auto")
}

async fn drive(
    mut socket: Socket,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> SessionEnd {
    // Subscription ids announced on this connection.
    let mut sent: HashSet<String> = HashSet::new();
    for (topic, id) in shared.registry.active() {
        debug!(target: "prodsync::push", topic = %topic, id = %id, "restoring subscription");
        if let Err(err) = socket
            .send(Message::Text(subscribe_frame(&topic, &id).encode()))
            .await
        {
            return SessionEnd::Dropped(err.to_string());
        }
        sent.insert(id);
    }

    loop {
        tokio::select! {
            incoming = socket.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(
                            frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by server".into()),
                        );
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                    None => return SessionEnd::Dropped("stream ended".into()),
                };
                let frames = match Frame::parse_all(&text) {
                    Ok(frames) => frames,
                    Err(err) => {
                        warn!(target: "prodsync::push", error = %err, "discarding unparseable frame");
                        continue;
                    }
                };
                for frame in frames {
                    match frame.command {
                        Command::Message => route(shared, &frame),
                        Command::Error => {
                            let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                            return SessionEnd::Dropped(format!("broker error: {reason}"));
                        }
                        _ => {}
                    }
                }
            }
            command = commands.recv() => {
                let outgoing = match command {
                    Some(ChannelCommand::Subscribe { topic, id }) => {
                        if !sent.insert(id.clone()) {
                            continue;
                        }
                        subscribe_frame(&topic, &id)
                    }
                    Some(ChannelCommand::Unsubscribe { id }) => {
                        if !sent.remove(&id) {
                            continue;
                        }
                        Frame::new(Command::Unsubscribe).header("id", id)
                    }
                    Some(ChannelCommand::Close) | None => {
                        let _ = socket
                            .send(Message::Text(Frame::new(Command::Disconnect).encode()))
                            .await;
                        let _ = socket.close(None).await;
                        info!(target: "prodsync::push", "push channel closed");
                        return SessionEnd::Closed;
                    }
                };
                if let Err(err) = socket.send(Message::Text(outgoing.encode())).await {
                    return SessionEnd::Dropped(err.to_string());
                }
            }
        }
    }
}

fn route(shared: &Shared, frame: &Frame) {
    let topic = frame
        .get("destination")
        .map(str::to_string)
        .or_else(|| {
            frame
                .get("subscription")
                .and_then(|id| shared.registry.topic_for_subscription(id))
        });
    match topic {
        Some(topic) => {
            shared.registry.dispatch(&topic, &frame.body);
        }
        None => warn!(target: "prodsync::push", "MESSAGE frame without destination"),
    }
}
