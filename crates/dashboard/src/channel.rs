//! Persistent WebSocket link to the remote authority.
//!
//! ```text
//! Disconnected ──▶ Connecting ──[open ok]──▶ Connected
//!      ▲               │                        │
//!      │          [open failed]           [closed / error]
//!      └───── wait reconnect_delay ◀────────────┘
//! ```
//!
//! A single task owns the connection and the retry timer, so there is never
//! more than one connection or one pending reconnect. Outbound messages are
//! best-effort: anything submitted while not connected is dropped, and
//! anything still queued when the link drops is discarded rather than
//! replayed on the next connection.
//!
//! A handshake that does not finish within `connect_timeout` counts as a
//! failed open. Once connected the client pings every `keep_alive`; a link
//! with no inbound frame for two periods is treated as lost.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::protocol::{Inbound, Outbound};
use crate::state::{ChatDirection, SharedState};
use crate::voice::VoiceQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

// ---------------------------------------------------------------------------
// Handle (cheap to clone, used by everything that sends)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    status: watch::Receiver<ConnState>,
}

impl ChannelHandle {
    pub fn status(&self) -> ConnState {
        *self.status.borrow()
    }

    /// Submit `msg` for delivery. Returns `false` (and drops the message)
    /// unless the channel is currently connected.
    pub fn send(&self, msg: Outbound) -> bool {
        let status = self.status();
        if status != ConnState::Connected {
            debug!(kind = msg.kind(), ?status, "channel not connected, dropping outbound");
            return false;
        }
        self.outbound.send(msg).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Client (owns the connection loop)
// ---------------------------------------------------------------------------

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

pub struct ChannelClient {
    url: String,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    keep_alive: Duration,
    shared: SharedState,
    advice_narrator: Option<VoiceQueue>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    status: watch::Sender<ConnState>,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl ChannelClient {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        shared: SharedState,
        advice_narrator: Option<VoiceQueue>,
    ) -> (Self, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnState::Disconnected);

        let client = Self {
            url: url.into(),
            reconnect_delay,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            shared,
            advice_narrator,
            outbound: rx,
            status: status_tx,
        };
        let handle = ChannelHandle {
            outbound: tx,
            status: status_rx,
        };
        (client, handle)
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, keep_alive: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.keep_alive = keep_alive;
        self
    }

    /// Run forever. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self) {
        info!(url = %self.url, reconnect_delay_sec = self.reconnect_delay.as_secs(), "channel client started");

        loop {
            self.set_status(ConnState::Connecting).await;

            match self.connect().await {
                Ok(socket) => {
                    self.discard_outbound();
                    self.set_status(ConnState::Connected).await;
                    let reason = self.pump(socket).await;
                    warn!(url = %self.url, "channel closed: {reason}");
                }
                Err(reason) => {
                    warn!(url = %self.url, "channel connect failed: {reason}");
                    self.shared.write().await.record_error(format!(
                        "channel connect failed: {reason}, retrying in {}s",
                        self.reconnect_delay.as_secs()
                    ));
                }
            }

            self.set_status(ConnState::Disconnected).await;
            self.discard_outbound();

            sleep(self.reconnect_delay).await;
        }
    }

    async fn connect(&self) -> Result<Socket, String> {
        match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no handshake after {:?}", self.connect_timeout)),
        }
    }

    /// Shuttle frames both ways until the connection ends. Returns why.
    async fn pump(&mut self, socket: Socket) -> String {
        let (mut sink, mut stream) = socket.split();

        let mut ping = interval_at(Instant::now() + self.keep_alive, self.keep_alive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_inbound(&self.shared, self.advice_narrator.as_ref(), text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return "closed by peer".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return e.to_string(),
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() >= self.keep_alive * 2 {
                        return format!("no frames for {:?}", last_seen.elapsed());
                    }
                    if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                        return format!("ping failed: {e}");
                    }
                }
                Some(msg) = self.outbound.recv() => {
                    let json = match msg.encode() {
                        Ok(json) => json,
                        Err(e) => {
                            error!(kind = msg.kind(), "failed to encode outbound message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(json)).await {
                        return format!("send failed: {e}");
                    }
                    debug!(kind = msg.kind(), "sent");
                }
            }
        }
    }

    async fn set_status(&self, next: ConnState) {
        let prev = self.status.send_replace(next);
        if prev == next {
            return;
        }

        let mut st = self.shared.write().await;
        st.channel_connected = next == ConnState::Connected;
        match (prev, next) {
            (_, ConnState::Connected) => {
                info!(url = %self.url, "channel connected");
                st.record_channel(format!("connected to {}", self.url));
            }
            (ConnState::Connected, ConnState::Disconnected) => {
                st.record_channel(format!(
                    "disconnected, retrying in {}s",
                    self.reconnect_delay.as_secs()
                ));
            }
            _ => {}
        }
    }

    fn discard_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded outbound messages from a dead connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Decode one text frame and apply it. Malformed or unknown messages are
/// logged and ignored.
pub(crate) async fn handle_inbound(
    shared: &SharedState,
    advice_narrator: Option<&VoiceQueue>,
    raw: &str,
) {
    let msg = match Inbound::decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("ignoring inbound message: {e}");
            return;
        }
    };

    match msg {
        Inbound::Chat { text } => {
            let mut st = shared.write().await;
            st.record_chat(ChatDirection::Incoming, text);
        }
        Inbound::State { state } => {
            let delta = state.unwrap_or_default();
            let fresh_advice = {
                let mut st = shared.write().await;
                st.farm.apply_remote_delta(&delta);
                st.recompute()
            };
            debug!(?delta, "applied remote state");

            if let (Some(voice), Some(text)) = (advice_narrator, fresh_advice) {
                voice.enqueue(text);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ActuatorPayload;
    use crate::state::{Actuator, Dashboard, EventKind};
    use crate::voice::SpeechBackend;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    /// Poll `cond` until it holds or two seconds pass.
    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn wait_status(handle: &ChannelHandle, want: ConnState) {
        assert!(
            eventually(|| handle.status() == want).await,
            "channel never reached {want:?}, stuck at {:?}",
            handle.status()
        );
    }

    // -- handle_inbound -----------------------------------------------------

    #[tokio::test]
    async fn inbound_state_merges_and_recomputes() {
        let shared = Dashboard::shared();
        handle_inbound(
            &shared,
            None,
            r#"{"type":"state","state":{"humidity":20,"rainProb":10,"wind":55,"battery":3}}"#,
        )
        .await;

        let st = shared.read().await;
        assert_eq!(st.farm.humidity, 20);
        assert_eq!(st.farm.wind, 55.0);
        assert!(st.farm.pump_on);
        assert!(st.farm.motor_on);
        assert_eq!(st.farm.protection_advice, crate::advisory::Hazard::StrongWind.advice());
    }

    #[tokio::test]
    async fn inbound_chat_only_touches_transcript() {
        let shared = Dashboard::shared();
        let before = shared.read().await.farm.clone();

        handle_inbound(&shared, None, r#"{"type":"chat","text":"رطوبة التربة جيدة"}"#).await;

        let st = shared.read().await;
        assert_eq!(st.farm, before);
        assert_eq!(st.chat.len(), 1);
        assert_eq!(st.chat[0].direction, ChatDirection::Incoming);
        assert_eq!(st.chat[0].text, "رطوبة التربة جيدة");
    }

    #[tokio::test]
    async fn inbound_garbage_is_ignored() {
        let shared = Dashboard::shared();
        let before = shared.read().await.farm.clone();

        for raw in ["", "{", r#"{"type":"echo","text":"x"}"#, r#"[1,2,3]"#] {
            handle_inbound(&shared, None, raw).await;
        }

        let st = shared.read().await;
        assert_eq!(st.farm, before);
        assert!(st.chat.is_empty());
    }

    #[tokio::test]
    async fn inbound_state_narrates_changed_advice() {
        let shared = Dashboard::shared();
        let voice = VoiceQueue::new(SpeechBackend::Silent);

        handle_inbound(&shared, Some(&voice), r#"{"type":"state","state":{"realtime":true}}"#)
            .await;
        assert!(voice.is_speaking() || voice.pending() > 0);
    }

    // -- Outbound while disconnected ----------------------------------------

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let (mut client, handle) = ChannelClient::new(
            "ws://127.0.0.1:9/ws",
            Duration::from_secs(5),
            Dashboard::shared(),
            None,
        );

        assert_eq!(handle.status(), ConnState::Disconnected);
        let sent = handle.send(Outbound::SetState {
            payload: ActuatorPayload {
                pump_on: Some(true),
                motor_on: Some(true),
            },
        });
        assert!(!sent);
        assert!(client.outbound.try_recv().is_err());
    }

    // -- Live connection ----------------------------------------------------

    #[tokio::test]
    async fn connects_receives_state_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let (got_tx, mut got_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::text(
                r#"{"type":"state","state":{"humidity":25,"realtime":false,"rainProb":5}}"#,
            ))
            .await
            .unwrap();
            ws.send(Message::text(r#"{"type":"chat","text":"أهلاً"}"#))
                .await
                .unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(t) = frame {
                    got_tx.send(t.as_str().to_string()).unwrap();
                }
            }
        });

        let shared = Dashboard::shared();
        let (client, handle) =
            ChannelClient::new(url, Duration::from_millis(100), Arc::clone(&shared), None);
        tokio::spawn(client.run());

        wait_status(&handle, ConnState::Connected).await;
        assert!(shared.read().await.channel_connected);

        let synced = timeout(Duration::from_secs(2), async {
            loop {
                {
                    let st = shared.read().await;
                    if st.farm.humidity == 25 && !st.chat.is_empty() {
                        return (st.farm.pump_on, st.farm.motor_on);
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("remote state never applied");
        assert_eq!(synced, (true, true));

        assert!(handle.send(Outbound::Chat {
            text: "متى أسقي؟".into()
        }));
        let raw = timeout(Duration::from_secs(2), got_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["text"], "متى أسقي؟");

        // Manual pump stop: the motor travels with it on the wire.
        let payload = {
            let mut st = shared.write().await;
            st.farm.set_actuator(Actuator::Pump, false);
            ActuatorPayload::after_change(Actuator::Pump, &st.farm)
        };
        assert!(handle.send(Outbound::SetState { payload }));
        let raw = timeout(Duration::from_secs(2), got_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "set_state");
        assert_eq!(json["payload"]["pumpOn"], false);
        assert_eq!(json["payload"]["motorOn"], false);
    }

    #[tokio::test]
    async fn refused_connection_stays_disconnected() {
        // Bind then drop so the port is very likely closed.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let shared = Dashboard::shared();
        let (client, handle) = ChannelClient::new(
            format!("ws://{addr}/ws"),
            Duration::from_millis(50),
            Arc::clone(&shared),
            None,
        );
        tokio::spawn(client.run());

        sleep(Duration::from_millis(200)).await;
        assert_ne!(handle.status(), ConnState::Connected);

        let st = shared.read().await;
        assert!(!st.channel_connected);
        assert!(
            st.events
                .iter()
                .any(|e| e.kind == EventKind::Error && e.detail.starts_with("channel connect failed")),
            "connect failure not recorded: {:?}",
            st.events
        );
    }

    #[tokio::test]
    async fn stalled_handshake_times_out_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));

        // Accept TCP but never answer the upgrade request.
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(tcp);
            }
        });

        let shared = Dashboard::shared();
        let (client, handle) =
            ChannelClient::new(url, Duration::from_millis(50), Arc::clone(&shared), None);
        let client = client.with_timeouts(Duration::from_millis(100), Duration::from_secs(30));
        tokio::spawn(client.run());

        assert!(eventually(|| accepted.load(Ordering::SeqCst) >= 2).await);
        assert_ne!(handle.status(), ConnState::Connected);

        let st = shared.read().await;
        assert!(st
            .events
            .iter()
            .any(|e| e.kind == EventKind::Error && e.detail.contains("no handshake")));
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_and_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));

        // Complete the handshake, then never read again, so pings go unanswered.
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                held.push(accept_async(tcp).await.unwrap());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let shared = Dashboard::shared();
        let (client, handle) =
            ChannelClient::new(url, Duration::from_millis(50), Arc::clone(&shared), None);
        let client = client.with_timeouts(Duration::from_secs(2), Duration::from_millis(100));
        tokio::spawn(client.run());

        wait_status(&handle, ConnState::Connected).await;
        assert!(eventually(|| accepted.load(Ordering::SeqCst) >= 2).await);

        let st = shared.read().await;
        assert!(st
            .events
            .iter()
            .any(|e| e.kind == EventKind::Channel && e.detail.starts_with("disconnected")));
    }

    #[tokio::test]
    async fn reconnects_once_after_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    // Drop the first connection straight away.
                    ws.close(None).await.ok();
                } else {
                    held.push(ws);
                }
            }
        });

        let delay = Duration::from_millis(400);
        let shared = Dashboard::shared();
        let (client, handle) = ChannelClient::new(url, delay, Arc::clone(&shared), None);
        tokio::spawn(client.run());

        assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1).await);
        wait_status(&handle, ConnState::Disconnected).await;

        // Still inside the reconnect delay: no new attempt yet.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        wait_status(&handle, ConnState::Connected).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        // The second connection is held open, so no further attempts follow.
        sleep(delay * 2).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        let st = shared.read().await;
        let channel_events = st
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Channel)
            .count();
        assert_eq!(channel_events, 3, "connect, disconnect, reconnect");
    }
}
