//! Persistent market-channel connection.
//!
//! A single background task owns the socket. Callers talk to it through a
//! cloneable [`FeedConnection`] handle; decoded messages and connection state
//! changes come back on one ordered [`FeedStream`].

use crate::config::FeedConfig;
use crate::ws::protocol::{self, ControlMessage, FeedMessage, PING_FRAME, PONG_FRAME};
use crate::ws::WsError;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet.
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Reconnected,
    Disconnected,
    /// Retry ceiling reached; waiting for an explicit `connect()`.
    UpstreamUnavailable,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Opens the transport. Swappable so the connection logic can run over
/// in-memory channels.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _response) = connect_async(url.as_str()).await?;
            let (write, read) = ws_stream.split();
            let sink: FrameSink = Box::pin(write.sink_map_err(WsError::Connection));
            let stream: FrameStream = Box::pin(read.map(|r| r.map_err(WsError::Connection)));
            Ok((sink, stream))
        })
    }
}

/// Exponential backoff with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

enum Command {
    Send {
        control: ControlMessage,
        ack: Option<oneshot::Sender<Result<(), WsError>>>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), WsError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Ordered sequence of decoded messages. Ends once the connection is closed.
pub struct FeedStream {
    rx: mpsc::UnboundedReceiver<FeedMessage>,
}

impl FeedStream {
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }
}

/// Pending write confirmation from [`FeedConnection::queue_flushed`].
pub struct FlushAck {
    rx: oneshot::Receiver<Result<(), WsError>>,
}

impl FlushAck {
    pub async fn wait(self) -> Result<(), WsError> {
        self.rx.await.map_err(|_| WsError::NotConnected)?
    }
}

struct ActorParts {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    msg_tx: mpsc::UnboundedSender<FeedMessage>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Inner {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Present until the first `connect()` spawns the actor.
    actor: Mutex<Option<ActorParts>>,
    messages: Mutex<Option<FeedStream>>,
}

/// Handle to one upstream market-channel connection.
#[derive(Clone)]
pub struct FeedConnection {
    inner: Arc<Inner>,
}

impl FeedConnection {
    pub fn new(config: FeedConfig) -> Result<Self, WsError> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: FeedConfig, connector: Arc<dyn Connector>) -> Result<Self, WsError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                cmd_tx,
                state_rx,
                actor: Mutex::new(Some(ActorParts {
                    cmd_rx,
                    msg_tx,
                    state_tx,
                })),
                messages: Mutex::new(Some(FeedStream { rx: msg_rx })),
            }),
        })
    }

    /// Connect, or confirm the connection is up. Resolves after the next
    /// handshake attempt; a failed attempt keeps retrying in the background.
    pub async fn connect(&self) -> Result<(), WsError> {
        match self.state() {
            s if s.is_connected() => return Ok(()),
            ConnectionState::Closed => return Err(WsError::Closed),
            _ => {}
        }

        let unstarted = self.inner.actor.lock().take();
        if let Some(parts) = unstarted {
            let actor = FeedActor {
                config: self.inner.config.clone(),
                connector: Arc::clone(&self.inner.connector),
                cmd_rx: parts.cmd_rx,
                msg_tx: parts.msg_tx,
                state_tx: parts.state_tx,
                waiters: Vec::new(),
                close_ack: None,
            };
            tokio::spawn(actor.run());
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Connect { reply })
            .map_err(|_| WsError::Closed)?;
        rx.await.map_err(|_| WsError::Closed)?
    }

    /// Queue a control frame. Frames issued while disconnected are dropped.
    pub fn send(&self, control: ControlMessage) -> Result<(), WsError> {
        self.inner
            .cmd_tx
            .send(Command::Send { control, ack: None })
            .map_err(|_| WsError::Closed)
    }

    /// Like [`send`](Self::send), but resolves once the frame is written.
    pub async fn send_flushed(&self, control: ControlMessage) -> Result<(), WsError> {
        self.queue_flushed(control)?.wait().await
    }

    /// Queue a control frame now and wait for the write later. The frame is
    /// ordered against every other command at the moment of this call.
    pub fn queue_flushed(&self, control: ControlMessage) -> Result<FlushAck, WsError> {
        if self.state() == ConnectionState::Idle {
            return Err(WsError::NotConnected);
        }
        let (ack, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Send {
                control,
                ack: Some(ack),
            })
            .map_err(|_| WsError::Closed)?;
        Ok(FlushAck { rx })
    }

    /// Take the inbound message sequence. Only the first call returns it.
    pub fn messages(&self) -> Option<FeedStream> {
        self.inner.messages.lock().take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    /// Terminal. Cancels reconnects and ends the message sequence.
    pub async fn close(&self) {
        let never_started = self.inner.actor.lock().take();
        if let Some(parts) = never_started {
            parts.state_tx.send_replace(ConnectionState::Closed);
            let _ = parts
                .msg_tx
                .send(FeedMessage::ConnectionStateChange(ConnectionState::Closed));
            return;
        }

        let (done, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

enum Attempt {
    Open(FrameSink, FrameStream),
    Failed(WsError),
    Closed,
}

enum SessionEnd {
    Close,
    Dropped(WsError),
}

struct FeedActor {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    msg_tx: mpsc::UnboundedSender<FeedMessage>,
    state_tx: watch::Sender<ConnectionState>,
    waiters: Vec<oneshot::Sender<Result<(), WsError>>>,
    close_ack: Option<oneshot::Sender<()>>,
}

impl FeedActor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_base(), self.config.reconnect_max());
        let mut failures: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting {
                    attempt: failures + 1,
                }
            } else {
                ConnectionState::Connecting
            });
            info!(url = %self.config.ws_url, attempt = failures + 1, "connecting to market feed");

            match self.attempt().await {
                Attempt::Closed => break,
                Attempt::Open(sink, stream) => {
                    failures = 0;
                    backoff.reset();
                    info!("market feed connected");
                    self.set_state(if ever_connected {
                        ConnectionState::Reconnected
                    } else {
                        ConnectionState::Connected
                    });
                    ever_connected = true;
                    self.resolve_waiters(|| Ok(()));

                    match self.drive(sink, stream).await {
                        SessionEnd::Close => break,
                        SessionEnd::Dropped(e) => {
                            warn!(error = %e, "market feed connection dropped");
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Attempt::Failed(e) => {
                    failures += 1;
                    error!(error = %e, attempt = failures, "market feed connect failed");
                    let ceiling_reached = self
                        .config
                        .max_reconnect_attempts
                        .is_some_and(|max| failures >= max);

                    if !ceiling_reached {
                        let reason = e.to_string();
                        self.resolve_waiters(|| Err(WsError::Handshake(reason.clone())));
                    } else {
                        warn!(attempts = failures, "retry ceiling reached, market feed unavailable");
                        self.set_state(ConnectionState::UpstreamUnavailable);
                        let attempts = failures;
                        self.resolve_waiters(|| Err(WsError::UpstreamUnavailable { attempts }));
                        if !self.park().await {
                            break;
                        }
                        failures = 0;
                        backoff.reset();
                        continue;
                    }
                }
            }

            let delay = backoff.next_delay();
            info!(delay = ?delay, "reconnecting to market feed");
            if !self.pause(delay).await {
                break;
            }
        }

        self.resolve_waiters(|| Err(WsError::Closed));
        self.set_state(ConnectionState::Closed);
        info!("market feed closed");
        if let Some(done) = self.close_ack.take() {
            let _ = done.send(());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.msg_tx.send(FeedMessage::ConnectionStateChange(state));
    }

    fn resolve_waiters(&mut self, outcome: impl Fn() -> Result<(), WsError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }

    /// Handle a command while no socket is open. Returns false on close.
    fn handle_offline(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Send { control, ack } => {
                debug!(
                    assets = control.asset_ids().len(),
                    "dropping control frame while disconnected"
                );
                if let Some(ack) = ack {
                    let _ = ack.send(Err(WsError::NotConnected));
                }
                true
            }
            Command::Connect { reply } => {
                self.waiters.push(reply);
                true
            }
            Command::Close { done } => {
                self.close_ack = Some(done);
                false
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let connect = timeout(
            self.config.connect_timeout(),
            self.connector.connect(&self.config.ws_url),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                res = &mut connect => {
                    return match res {
                        Ok(Ok((sink, stream))) => Attempt::Open(sink, stream),
                        Ok(Err(e)) => Attempt::Failed(e),
                        Err(_) => Attempt::Failed(WsError::ConnectTimeout),
                    };
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_offline(cmd) {
                                return Attempt::Closed;
                            }
                        }
                        None => return Attempt::Closed,
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay. Returns false on close.
    async fn pause(&mut self, delay: Duration) -> bool {
        let delay = sleep(delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return true,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_offline(cmd) {
                                return false;
                            }
                        }
                        None => return false,
                    }
                }
            }
        }
    }

    /// Wait for an explicit `connect()` after the retry ceiling. Returns false on close.
    async fn park(&mut self) -> bool {
        loop {
            match self.cmd_rx.recv().await {
                Some(Command::Connect { reply }) => {
                    self.waiters.push(reply);
                    return true;
                }
                Some(cmd) => {
                    if !self.handle_offline(cmd) {
                        return false;
                    }
                }
                None => return false,
            }
        }
    }

    async fn drive(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        let heartbeat = self.config.heartbeat_interval();
        let silence_limit = self.config.heartbeat_timeout();
        let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();
        let mut first_subscribe = true;
        // Instruments subscribed on this socket.
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut decode_failures = 0u64;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send { control, ack }) => {
                            let Some(control) = effective_control(control, &subscribed) else {
                                debug!("control frame already reflected on this socket");
                                if let Some(ack) = ack {
                                    let _ = ack.send(Ok(()));
                                }
                                continue;
                            };
                            let is_subscribe = matches!(control, ControlMessage::Subscribe(_));
                            let frame = control.to_frame(first_subscribe && is_subscribe);
                            match sink.send(Message::Text(frame.into())).await {
                                Ok(()) => {
                                    if is_subscribe {
                                        first_subscribe = false;
                                    }
                                    match &control {
                                        ControlMessage::Subscribe(ids) => subscribed.extend(ids.iter().cloned()),
                                        ControlMessage::Unsubscribe(ids) => {
                                            for id in ids {
                                                subscribed.remove(id);
                                            }
                                        }
                                    }
                                    debug!(frame = ?control, "sent control frame");
                                    if let Some(ack) = ack {
                                        let _ = ack.send(Ok(()));
                                    }
                                }
                                Err(e) => {
                                    if let Some(ack) = ack {
                                        let _ = ack.send(Err(WsError::NotConnected));
                                    }
                                    return SessionEnd::Dropped(e);
                                }
                            }
                        }
                        Some(Command::Connect { reply }) => {
                            let _ = reply.send(Ok(()));
                        }
                        Some(Command::Close { done }) => {
                            self.close_ack = Some(done);
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Close;
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Close;
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Text(PING_FRAME.into())).await {
                        return SessionEnd::Dropped(e);
                    }
                }
                _ = sleep_until(last_inbound + silence_limit) => {
                    return SessionEnd::Dropped(WsError::HeartbeatTimeout);
                }
                frame = stream.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return SessionEnd::Dropped(e),
                        None => return SessionEnd::Dropped(WsError::Closed),
                    };
                    last_inbound = Instant::now();
                    match msg {
                        Message::Text(text) => self.handle_text(&text, &mut decode_failures),
                        Message::Binary(bytes) => {
                            self.handle_text(&String::from_utf8_lossy(&bytes), &mut decode_failures)
                        }
                        Message::Ping(data) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                return SessionEnd::Dropped(e);
                            }
                        }
                        Message::Pong(_) => {}
                        Message::Close(frame) => {
                            info!(frame = ?frame, "market feed received close frame");
                            return SessionEnd::Dropped(WsError::Closed);
                        }
                        Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str, decode_failures: &mut u64) {
        if text.trim() == PONG_FRAME {
            debug!("market feed pong");
            return;
        }
        if self.config.verbose {
            info!(preview = %protocol::preview(text), "market feed frame");
        }

        match protocol::decode_frame(text, now_ms()) {
            Ok(messages) => {
                for msg in messages {
                    let _ = self.msg_tx.send(msg);
                }
            }
            Err(e) => {
                *decode_failures += 1;
                if *decode_failures <= 5 {
                    warn!(
                        error = %e,
                        failures = *decode_failures,
                        preview = %protocol::preview(text),
                        "dropping undecodable market frame"
                    );
                } else {
                    debug!(error = %e, "dropping undecodable market frame");
                }
            }
        }
    }
}

/// Drop ids the socket already agrees on: repeat subscribes and unsubscribes
/// for instruments this socket never subscribed. `None` when nothing is left.
fn effective_control(control: ControlMessage, subscribed: &HashSet<String>) -> Option<ControlMessage> {
    let mut seen = HashSet::new();
    let filtered = match control {
        ControlMessage::Subscribe(ids) => ControlMessage::Subscribe(
            ids.into_iter()
                .filter(|id| !subscribed.contains(id) && seen.insert(id.clone()))
                .collect(),
        ),
        ControlMessage::Unsubscribe(ids) => ControlMessage::Unsubscribe(
            ids.into_iter()
                .filter(|id| subscribed.contains(id) && seen.insert(id.clone()))
                .collect(),
        ),
    };
    (!filtered.asset_ids().is_empty()).then_some(filtered)
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use futures::channel::mpsc as chan;

    /// Server half of one accepted in-memory connection.
    pub struct ServerEnd {
        pub inbound: chan::UnboundedSender<Result<Message, WsError>>,
        pub outbound: chan::UnboundedReceiver<Message>,
    }

    impl ServerEnd {
        pub fn push_text(&self, text: &str) {
            let _ = self.inbound.unbounded_send(Ok(Message::Text(text.to_string())));
        }

        /// Next text frame the client wrote, skipping everything else.
        pub async fn next_text(&mut self) -> Option<String> {
            loop {
                match self.outbound.next().await? {
                    Message::Text(text) => return Some(text.to_string()),
                    _ => continue,
                }
            }
        }

        /// Next text frame that is not a heartbeat ping.
        pub async fn next_control(&mut self) -> Option<String> {
            loop {
                let text = self.next_text().await?;
                if text != PING_FRAME {
                    return Some(text);
                }
            }
        }
    }

    pub struct MockConnector {
        accepted: mpsc::UnboundedSender<ServerEnd>,
        fail_remaining: Mutex<u32>,
        attempts: Mutex<u32>,
    }

    impl MockConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                accepted,
                fail_remaining: Mutex::new(0),
                attempts: Mutex::new(0),
            });
            (connector, rx)
        }

        pub fn fail_next(&self, n: u32) {
            *self.fail_remaining.lock() = n;
        }

        pub fn attempts(&self) -> u32 {
            *self.attempts.lock()
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>> {
            *self.attempts.lock() += 1;
            {
                let mut remaining = self.fail_remaining.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Box::pin(async { Err(WsError::Handshake("connection refused".into())) });
                }
            }

            let (in_tx, in_rx) = chan::unbounded();
            let (out_tx, out_rx) = chan::unbounded();
            let _ = self.accepted.send(ServerEnd {
                inbound: in_tx,
                outbound: out_rx,
            });
            let sink: FrameSink = Box::pin(out_tx.sink_map_err(|_| WsError::Closed));
            let stream: FrameStream = Box::pin(in_rx);
            Box::pin(async move { Ok((sink, stream)) })
        }
    }

    pub fn test_config() -> FeedConfig {
        FeedConfig {
            ws_url: "ws://feed.test/ws/market".to_string(),
            connect_timeout_ms: 1_000,
            heartbeat_interval_ms: 60_000,
            heartbeat_timeout_ms: 120_000,
            reconnect_base_ms: 10,
            reconnect_max_ms: 40,
            max_reconnect_attempts: None,
            verbose: false,
        }
    }

    pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != target {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for connection state");
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use serde_json::Value;

    async fn next_message(stream: &mut FeedStream) -> FeedMessage {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
    }

    async fn next_data_message(stream: &mut FeedStream) -> FeedMessage {
        loop {
            match next_message(stream).await {
                FeedMessage::ConnectionStateChange(_) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_frames_follow_protocol() {
        let (connector, mut servers) = MockConnector::new();
        let feed = FeedConnection::with_connector(test_config(), connector.clone()).unwrap();
        let mut stream = feed.messages().unwrap();
        assert!(feed.messages().is_none());
        assert_eq!(feed.state(), ConnectionState::Idle);

        feed.connect().await.unwrap();
        feed.connect().await.unwrap();
        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);

        let mut server = servers.recv().await.unwrap();
        feed.send(ControlMessage::Subscribe(vec!["Y1".into(), "N1".into()])).unwrap();
        feed.send_flushed(ControlMessage::Subscribe(vec!["Z1".into()])).await.unwrap();

        let first: Value = serde_json::from_str(&server.next_control().await.unwrap()).unwrap();
        assert_eq!(first["type"], "market");
        assert_eq!(first["assets_ids"][0], "Y1");
        let second: Value = serde_json::from_str(&server.next_control().await.unwrap()).unwrap();
        assert_eq!(second["operation"], "subscribe");

        assert_eq!(
            next_message(&mut stream).await,
            FeedMessage::ConnectionStateChange(ConnectionState::Connecting)
        );
        assert_eq!(
            next_message(&mut stream).await,
            FeedMessage::ConnectionStateChange(ConnectionState::Connected)
        );

        server.push_text("garbage {");
        server.push_text(PONG_FRAME);
        server.push_text(r#"{"event_type":"last_trade_price","asset_id":"Y1","price":"0.5","side":"SELL","timestamp":"10"}"#);
        match next_message(&mut stream).await {
            FeedMessage::LastTrade(trade) => assert_eq!(trade.asset_id, "Y1"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (connector, _servers) = MockConnector::new();
        let config = FeedConfig {
            reconnect_base_ms: 10_000,
            reconnect_max_ms: 10_000,
            ..test_config()
        };
        let feed = FeedConnection::with_connector(config, connector.clone()).unwrap();
        connector.fail_next(1);
        assert!(feed.connect().await.is_err());

        // actor is now sleeping out its backoff
        feed.send(ControlMessage::Subscribe(vec!["Y1".into()])).unwrap();
        let flushed = feed
            .send_flushed(ControlMessage::Unsubscribe(vec!["Y1".into()]))
            .await;
        assert!(matches!(flushed, Err(WsError::NotConnected)));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_drop() {
        let (connector, mut servers) = MockConnector::new();
        let feed = FeedConnection::with_connector(test_config(), connector.clone()).unwrap();
        let mut stream = feed.messages().unwrap();
        let mut states = feed.state_changes();

        feed.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        drop(server);

        wait_for_state(&mut states, ConnectionState::Reconnected).await;
        let server = servers.recv().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        server.push_text(r#"{"event_type":"best_bid_ask","asset_id":"N1","best_bid":"0.4","best_ask":"0.42","timestamp":"3"}"#);
        match next_data_message(&mut stream).await {
            FeedMessage::PriceChange(p) => assert_eq!(p.asset_id, "N1"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_ceiling_reports_upstream_unavailable() {
        let (connector, mut servers) = MockConnector::new();
        let config = FeedConfig {
            max_reconnect_attempts: Some(3),
            ..test_config()
        };
        let feed = FeedConnection::with_connector(config, connector.clone()).unwrap();
        let mut states = feed.state_changes();
        connector.fail_next(10);

        assert!(matches!(feed.connect().await, Err(WsError::Handshake(_))));
        wait_for_state(&mut states, ConnectionState::UpstreamUnavailable).await;
        assert_eq!(connector.attempts(), 3);

        // no automatic retries while parked
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.attempts(), 3);

        connector.fail_next(0);
        feed.connect().await.unwrap();
        assert_eq!(feed.state(), ConnectionState::Connected);
        assert!(servers.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_silence_forces_reconnect() {
        let (connector, mut servers) = MockConnector::new();
        let config = FeedConfig {
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 80,
            ..test_config()
        };
        let feed = FeedConnection::with_connector(config, connector.clone()).unwrap();
        let mut states = feed.state_changes();
        feed.connect().await.unwrap();

        let mut first = servers.recv().await.unwrap();
        assert_eq!(first.next_text().await.as_deref(), Some(PING_FRAME));

        // first server stays open but silent
        wait_for_state(&mut states, ConnectionState::Reconnected).await;
        assert!(servers.recv().await.is_some());
        drop(first);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (connector, mut servers) = MockConnector::new();
        let feed = FeedConnection::with_connector(test_config(), connector).unwrap();
        let mut stream = feed.messages().unwrap();
        feed.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        feed.close().await;
        assert_eq!(feed.state(), ConnectionState::Closed);
        assert!(matches!(feed.connect().await, Err(WsError::Closed)));

        let mut saw_close_frame = false;
        while let Some(msg) = server.outbound.next().await {
            if matches!(msg, Message::Close(_)) {
                saw_close_frame = true;
            }
        }
        assert!(saw_close_frame);

        let mut last = None;
        while let Some(msg) = stream.recv().await {
            last = Some(msg);
        }
        assert_eq!(last, Some(FeedMessage::ConnectionStateChange(ConnectionState::Closed)));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let (connector, _servers) = MockConnector::new();
        let feed = FeedConnection::with_connector(test_config(), connector).unwrap();
        let mut stream = feed.messages().unwrap();
        feed.close().await;
        assert_eq!(feed.state(), ConnectionState::Closed);
        assert_eq!(
            stream.recv().await,
            Some(FeedMessage::ConnectionStateChange(ConnectionState::Closed))
        );
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_invalid_feed_config_is_rejected() {
        let (connector, _servers) = MockConnector::new();
        let config = FeedConfig {
            heartbeat_interval_ms: 0,
            ..test_config()
        };
        assert!(matches!(
            FeedConnection::with_connector(config, connector),
            Err(WsError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reports_ceiling_as_upstream_unavailable() {
        let (connector, _servers) = MockConnector::new();
        let config = FeedConfig {
            max_reconnect_attempts: Some(1),
            ..test_config()
        };
        let feed = FeedConnection::with_connector(config, connector.clone()).unwrap();
        connector.fail_next(5);

        assert!(matches!(
            feed.connect().await,
            Err(WsError::UpstreamUnavailable { attempts: 1 })
        ));
        assert_eq!(feed.state(), ConnectionState::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn test_socket_drops_redundant_control_frames() {
        let (connector, mut servers) = MockConnector::new();
        let feed = FeedConnection::with_connector(test_config(), connector).unwrap();
        feed.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        let sub = |ids: &[&str]| ControlMessage::Subscribe(ids.iter().map(|s| s.to_string()).collect());
        let unsub = |ids: &[&str]| ControlMessage::Unsubscribe(ids.iter().map(|s| s.to_string()).collect());
        feed.send_flushed(sub(&["A"])).await.unwrap();
        feed.send_flushed(sub(&["A"])).await.unwrap();
        feed.send_flushed(sub(&["A", "B", "B"])).await.unwrap();
        feed.send_flushed(unsub(&["C"])).await.unwrap();
        feed.send_flushed(unsub(&["A", "C"])).await.unwrap();
        feed.send_flushed(sub(&["A"])).await.unwrap();

        let mut frames = Vec::new();
        for _ in 0..4 {
            let text = server.next_control().await.unwrap();
            frames.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(frames[0], serde_json::json!({"type": "market", "assets_ids": ["A"]}));
        assert_eq!(frames[1], serde_json::json!({"operation": "subscribe", "assets_ids": ["B"]}));
        assert_eq!(frames[2], serde_json::json!({"operation": "unsubscribe", "assets_ids": ["A"]}));
        assert_eq!(frames[3], serde_json::json!({"operation": "subscribe", "assets_ids": ["A"]}));

        let extra = tokio::time::timeout(Duration::from_millis(50), server.next_control()).await;
        assert!(extra.is_err(), "unexpected frame {extra:?}");
    }
}
