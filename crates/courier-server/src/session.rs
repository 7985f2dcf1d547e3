//! One live connection from upgrade to teardown.
//!
//! The offline backlog is written straight to the socket first, so an entry
//! counts as delivered only once its write succeeded. After that two duties
//! run, joined by the connection's bounded outbound buffer:
//! - the writer drains the buffer into the socket, each write bounded by
//!   `write_wait`, and closes the socket when the hub closes the buffer
//! - the reader handles heartbeat and typing frames until the client goes away
//!
//! Whichever duty ends first, teardown runs once afterwards.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use courier_shared::{ClientFrame, Identity, LocationId};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionKey};
use crate::hub::HubHandle;
use crate::offline_queue::{OfflineQueue, QueueKey};
use crate::presence::PresenceTracker;
use crate::relay::Relay;
use crate::throttle::TokenBucket;

/// Per-connection limits, taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub outbound_capacity: usize,
    pub write_wait: Duration,
    pub inbound_rate: f64,
    pub inbound_burst: f64,
}

impl SessionLimits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_capacity,
            write_wait: config.write_wait,
            inbound_rate: config.inbound_rate,
            inbound_burst: config.inbound_burst,
        }
    }
}

/// Everything a session needs, shared by all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: HubHandle,
    pub queue: OfflineQueue,
    pub presence: PresenceTracker,
    pub relay: Relay,
    pub limits: SessionLimits,
}

/// Drive a connection until it closes.
pub async fn run_session<S, E>(
    ctx: SessionContext,
    socket: S,
    identity: Identity,
    location: LocationId,
) where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let (connection, outbound) =
        Connection::open(identity, location, ctx.limits.outbound_capacity);
    let key = connection.key();

    match ctx.hub.register(connection).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(conn = %key.id, "Connection id already registered");
            return;
        }
        Err(e) => {
            warn!(conn = %key.id, error = %e, "Could not register connection");
            return;
        }
    }

    // Registered first: a concurrent release sees this connection and keeps
    // the feed.
    if let Err(e) = ctx.relay.subscribe(&key.location).await {
        warn!(location = %key.location, error = %e, "Relay subscription failed, local delivery only");
    }

    if let Err(e) = ctx.presence.mark_online(&key.identity).await {
        warn!(identity = %key.identity, error = %e, "Presence update failed");
    }

    let (mut sink, stream) = socket.split();

    // Live traffic routed meanwhile waits in the outbound buffer.
    if !deliver_backlog(&ctx, &key, &mut sink).await {
        teardown(&ctx, &key).await;
        return;
    }

    let mut writer = tokio::spawn(write_duty(sink, outbound, ctx.limits.write_wait));

    let writer_done = tokio::select! {
        _ = read_duty(stream, &ctx, &key) => false,
        _ = &mut writer => true,
    };

    teardown(&ctx, &key).await;

    // Unregister closed the buffer; give the writer its bounded wait to send
    // the close frame.
    if !writer_done && timeout(ctx.limits.write_wait, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Write the offline backlog to the socket, oldest first.
///
/// Entries whose write succeeded are confirmed; the first failed or timed out
/// write puts it and everything after it back at the head of the queue.
/// Returns `false` when the socket is unusable.
async fn deliver_backlog<W>(ctx: &SessionContext, key: &ConnectionKey, sink: &mut W) -> bool
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let queue_key = QueueKey::new(&key.identity, &key.location);
    let backlog = match ctx.queue.flush(&queue_key).await {
        Ok(backlog) => backlog,
        Err(e) => {
            warn!(key = %queue_key, error = %e, "Offline flush failed");
            return true;
        }
    };

    let mut written = 0;
    let mut healthy = true;
    for entry in &backlog {
        match timeout(ctx.limits.write_wait, sink.send(to_message(entry.payload.clone()))).await {
            Ok(Ok(())) => written += 1,
            Ok(Err(e)) => {
                debug!(conn = %key.id, error = %e, "Backlog write failed");
                healthy = false;
                break;
            }
            Err(_) => {
                warn!(conn = %key.id, "Backlog write timed out");
                healthy = false;
                break;
            }
        }
    }

    let (delivered, undelivered) = backlog.split_at(written);
    ctx.queue.confirm(&queue_key, delivered).await;
    if let Err(e) = ctx.queue.requeue(&queue_key, undelivered).await {
        warn!(key = %queue_key, error = %e, lost = undelivered.len(), "Backlog requeue failed");
    }

    if !backlog.is_empty() {
        debug!(
            conn = %key.id,
            written,
            requeued = undelivered.len(),
            "Offline backlog delivered"
        );
    }
    healthy
}

/// Remove the connection from the hub, settle presence, then let the relay
/// drop the location if nothing local is left there.
async fn teardown(ctx: &SessionContext, key: &ConnectionKey) {
    if let Err(e) = ctx.hub.unregister(key).await {
        warn!(conn = %key.id, error = %e, "Unregister failed");
    }

    settle_presence(ctx, &key.identity).await;

    if let Err(e) = ctx.relay.release_if_idle(&key.location).await {
        warn!(location = %key.location, error = %e, "Relay release failed");
    }

    info!(conn = %key.id, identity = %key.identity, location = %key.location, "Session closed");
}

/// Mark the identity offline unless it still holds a connection.
///
/// Sessions register before marking online, so a session that registers after
/// the second check will set the flag after our delete.
async fn settle_presence(ctx: &SessionContext, identity: &Identity) {
    match ctx.hub.is_connected(identity).await {
        Ok(true) => {
            debug!(identity = %identity, "Other connections remain, staying online");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(identity = %identity, error = %e, "Hub unavailable during teardown");
            return;
        }
    }

    if let Err(e) = ctx.presence.mark_offline(identity).await {
        warn!(identity = %identity, error = %e, "Presence update failed");
    }

    match ctx.hub.is_connected(identity).await {
        Ok(true) => {
            debug!(identity = %identity, "Reconnected during teardown, restoring online flag");
            if let Err(e) = ctx.presence.mark_online(identity).await {
                warn!(identity = %identity, error = %e, "Presence update failed");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(identity = %identity, error = %e, "Hub unavailable during teardown"),
    }
}

/// Drain the outbound buffer into the socket until the buffer closes or a
/// write fails or times out.
async fn write_duty<W>(mut sink: W, mut outbound: mpsc::Receiver<Bytes>, write_wait: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(payload) = outbound.recv().await {
        match timeout(write_wait, sink.send(to_message(payload))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Socket write failed");
                return;
            }
            Err(_) => {
                warn!(wait_secs = write_wait.as_secs(), "Socket write timed out");
                return;
            }
        }
    }

    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
}

/// JSON payloads go out as text frames; anything else as binary.
fn to_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}

async fn read_duty<R, E>(mut stream: R, ctx: &SessionContext, key: &ConnectionKey)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut bucket = TokenBucket::new(ctx.limits.inbound_rate, ctx.limits.inbound_burst);

    while let Some(next) = stream.next().await {
        let data = match next {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            // Control frames are answered by the transport.
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %key.id, error = %e, "Socket read failed");
                break;
            }
        };

        if !bucket.try_consume() {
            warn!(conn = %key.id, identity = %key.identity, "Inbound rate exceeded, frame dropped");
            continue;
        }

        match ClientFrame::parse(&data) {
            Some(ClientFrame::Ping) => {
                if let Err(e) = ctx.presence.mark_online(&key.identity).await {
                    warn!(identity = %key.identity, error = %e, "Heartbeat not recorded");
                }
            }
            Some(ClientFrame::Typing { .. }) => {
                if let Err(e) = ctx.hub.broadcast(&key.location, data).await {
                    warn!(location = %key.location, error = %e, "Typing broadcast failed");
                }
            }
            Some(ClientFrame::Unknown) | None => {
                debug!(conn = %key.id, "Ignoring unrecognised frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::testing::Harness;
    use futures::channel::mpsc as chan;
    use futures::channel::mpsc::SendError;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use courier_shared::MessageEnvelope;
    use courier_store::KvStore;

    /// In-memory stand-in for a WebSocket.
    struct FakeSocket {
        incoming: chan::UnboundedReceiver<Result<Message, SendError>>,
        outgoing: chan::UnboundedSender<Message>,
        /// Writes accepted before the socket breaks; unlimited when `None`.
        writes_left: Option<usize>,
    }

    /// The client's end of a [`FakeSocket`].
    struct Client {
        tx: chan::UnboundedSender<Result<Message, SendError>>,
        rx: chan::UnboundedReceiver<Message>,
    }

    fn socket_pair() -> (FakeSocket, Client) {
        let (client_tx, incoming) = chan::unbounded();
        let (outgoing, client_rx) = chan::unbounded();
        (
            FakeSocket {
                incoming,
                outgoing,
                writes_left: None,
            },
            Client {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }

    /// A socket whose writes fail after the first `writes`.
    fn breaking_socket_pair(writes: usize) -> (FakeSocket, Client) {
        let (mut socket, client) = socket_pair();
        socket.writes_left = Some(writes);
        if writes == 0 {
            socket.outgoing.disconnect();
        }
        (socket, client)
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, SendError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_next_unpin(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = SendError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_ready(cx)
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), SendError> {
            let this = self.get_mut();
            Pin::new(&mut this.outgoing).start_send(item)?;
            if let Some(left) = this.writes_left.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    this.outgoing.disconnect();
                }
            }
            Ok(())
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), SendError>> {
            Pin::new(&mut self.outgoing).poll_close(cx)
        }
    }

    impl Client {
        fn send_text(&self, text: &str) {
            self.tx
                .unbounded_send(Ok(Message::Text(text.into())))
                .unwrap();
        }

        async fn next_text(&mut self) -> String {
            let next = tokio::time::timeout(Duration::from_secs(1), self.rx.next())
                .await
                .unwrap()
                .unwrap();
            match next {
                Message::Text(text) => text.as_str().to_string(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    fn context(h: &Harness) -> SessionContext {
        SessionContext {
            hub: h.hub.clone(),
            queue: h.queue.clone(),
            presence: PresenceTracker::new(
                std::sync::Arc::new(h.store.clone()),
                Duration::from_secs(60),
            ),
            relay: h.relay.clone(),
            limits: SessionLimits {
                outbound_capacity: 8,
                write_wait: Duration::from_secs(1),
                inbound_rate: 100.0,
                inbound_burst: 100.0,
            },
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn start(ctx: &SessionContext, identity: Identity) -> (tokio::task::JoinHandle<()>, Client) {
        let (socket, client) = socket_pair();
        let handle = tokio::spawn(run_session(ctx.clone(), socket, identity, "L1".into()));
        (handle, client)
    }

    #[tokio::test]
    async fn test_reconnect_flushes_backlog_then_receives_live() {
        let h = Harness::new();
        let ctx = context(&h);
        let c1 = Identity::contact("C1");

        let queued = MessageEnvelope::text("L1", "queued").addressed_to(&c1);
        h.router.route(&queued).await.unwrap();

        let (_session, mut client) = start(&ctx, c1.clone());
        let first = client.next_text().await;
        assert_eq!(MessageEnvelope::from_slice(first.as_bytes()).unwrap().id, queued.id);
        let receipts = h.receipts.clone();
        eventually(|| {
            let receipts = receipts.clone();
            async move { *receipts.calls.lock().await == vec![vec![queued.id]] }
        })
        .await;

        let hub = h.hub.clone();
        let live_c1 = c1.clone();
        eventually(|| {
            let hub = hub.clone();
            let c1 = live_c1.clone();
            async move { hub.is_live(&"L1".into(), &c1).await.unwrap() }
        })
        .await;
        assert!(ctx.presence.is_online(&c1).await.unwrap());

        let live = MessageEnvelope::text("L1", "live").addressed_to(&c1);
        h.router.route(&live).await.unwrap();
        let second = client.next_text().await;
        assert_eq!(MessageEnvelope::from_slice(second.as_bytes()).unwrap().id, live.id);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_once() {
        let h = Harness::new();
        let ctx = context(&h);
        let u1 = Identity::user("U1");

        let (session, client) = start(&ctx, u1.clone());
        let hub = h.hub.clone();
        let check = u1.clone();
        eventually(|| {
            let hub = hub.clone();
            let u1 = check.clone();
            async move { hub.is_connected(&u1).await.unwrap() }
        })
        .await;

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();

        assert!(!h.hub.is_connected(&u1).await.unwrap());
        assert!(!ctx.presence.is_online(&u1).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_connection_keeps_identity_online() {
        let h = Harness::new();
        let ctx = context(&h);
        let u1 = Identity::user("U1");

        let (first, first_client) = start(&ctx, u1.clone());
        let (_second, mut second_client) = start(&ctx, u1.clone());
        let hub = h.hub.clone();
        eventually(|| {
            let hub = hub.clone();
            async move {
                hub.stats()
                    .await
                    .unwrap()
                    .first()
                    .is_some_and(|s| s.connections == 2)
            }
        })
        .await;

        first_client.tx.close_channel();
        tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .unwrap()
            .unwrap();

        assert!(h.hub.is_live(&"L1".into(), &u1).await.unwrap());
        assert!(ctx.presence.is_online(&u1).await.unwrap());

        // The survivor still receives traffic.
        h.router
            .route(&MessageEnvelope::text("L1", "still").addressed_to(&u1))
            .await
            .unwrap();
        assert!(second_client.next_text().await.contains("still"));
    }

    #[tokio::test]
    async fn test_typing_rebroadcast_and_junk_ignored() {
        let h = Harness::new();
        let ctx = context(&h);

        let (_a, typist) = start(&ctx, Identity::user("U1"));
        let (_b, mut watcher) = start(&ctx, Identity::contact("C1"));
        let hub = h.hub.clone();
        eventually(|| {
            let hub = hub.clone();
            async move {
                hub.stats()
                    .await
                    .unwrap()
                    .first()
                    .is_some_and(|s| s.connections == 2)
            }
        })
        .await;

        typist.send_text("{not json");
        typist.send_text(r#"{"type":"dance"}"#);
        typist.send_text(r#"{"type":"typing","session_id":"s1","typing":true}"#);

        let got = watcher.next_text().await;
        let value: serde_json::Value = serde_json::from_str(&got).unwrap();
        assert_eq!(value["type"], "typing");
        assert_eq!(value["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_ping_refreshes_presence() {
        let h = Harness::new();
        let ctx = context(&h);
        let c1 = Identity::contact("C1");

        let (_session, client) = start(&ctx, c1.clone());
        let presence = ctx.presence.clone();
        let check = c1.clone();
        eventually(|| {
            let presence = presence.clone();
            let c1 = check.clone();
            async move { presence.is_online(&c1).await.unwrap() }
        })
        .await;

        // Simulate the flag lapsing, then heartbeat.
        ctx.presence.mark_offline(&c1).await.unwrap();
        client.send_text(r#"{"type":"ping"}"#);

        eventually(|| {
            let presence = presence.clone();
            let c1 = c1.clone();
            async move { presence.is_online(&c1).await.unwrap() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_writer_closes_socket_when_buffer_closes() {
        let (socket, mut client) = socket_pair();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        tx.send(Bytes::from_static(&[0xff, 0x00])).await.unwrap();
        drop(tx);

        write_duty(socket, rx, Duration::from_secs(1)).await;

        assert!(matches!(client.rx.next().await, Some(Message::Text(_))));
        assert!(matches!(client.rx.next().await, Some(Message::Binary(_))));
        assert!(matches!(client.rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_throttled_frames_are_dropped() {
        let h = Harness::new();
        let mut ctx = context(&h);
        ctx.limits.inbound_rate = 0.001;
        ctx.limits.inbound_burst = 1.0;

        let (_a, typist) = start(&ctx, Identity::user("U1"));
        let (_b, mut watcher) = start(&ctx, Identity::contact("C1"));
        let hub = h.hub.clone();
        eventually(|| {
            let hub = hub.clone();
            async move {
                hub.stats()
                    .await
                    .unwrap()
                    .first()
                    .is_some_and(|s| s.connections == 2)
            }
        })
        .await;

        typist.send_text(r#"{"type":"typing","typing":true}"#);
        typist.send_text(r#"{"type":"typing","typing":false}"#);

        let first: serde_json::Value = serde_json::from_str(&watcher.next_text().await).unwrap();
        assert_eq!(first["typing"], true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.rx.try_next().is_err());
    }

    async fn queue_backlog(h: &Harness, to: &Identity, count: usize) -> Vec<MessageEnvelope> {
        let mut sent = Vec::new();
        for i in 0..count {
            let envelope = MessageEnvelope::text("L1", format!("m{i}")).addressed_to(to);
            h.router.route(&envelope).await.unwrap();
            sent.push(envelope);
        }
        sent
    }

    fn queued_ids(batch: &[crate::offline_queue::QueuedMessage]) -> Vec<uuid::Uuid> {
        batch.iter().filter_map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn test_dead_socket_keeps_whole_backlog_unconfirmed() {
        let h = Harness::new();
        let mut ctx = context(&h);
        ctx.limits.outbound_capacity = 1;
        let c1 = Identity::contact("C1");
        let sent = queue_backlog(&h, &c1, 4).await;

        let (socket, client) = socket_pair();
        drop(client.rx);
        tokio::time::timeout(
            Duration::from_secs(2),
            run_session(ctx.clone(), socket, c1.clone(), "L1".into()),
        )
        .await
        .unwrap();

        assert!(h.receipts.calls.lock().await.is_empty());
        let key = Harness::key(&c1, "L1");
        let ids: Vec<_> = sent.iter().map(|e| e.id).collect();
        assert_eq!(queued_ids(&h.queue.flush(&key).await.unwrap()), ids);
        assert!(!h.hub.is_connected(&c1).await.unwrap());
        assert!(!ctx.presence.is_online(&c1).await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_backlog_write_confirms_prefix_and_requeues_rest() {
        let h = Harness::new();
        let mut ctx = context(&h);
        ctx.limits.outbound_capacity = 1;
        let c1 = Identity::contact("C1");
        let sent = queue_backlog(&h, &c1, 4).await;

        let (socket, mut client) = breaking_socket_pair(2);
        tokio::time::timeout(
            Duration::from_secs(2),
            run_session(ctx.clone(), socket, c1.clone(), "L1".into()),
        )
        .await
        .unwrap();

        for envelope in &sent[..2] {
            let got = client.next_text().await;
            assert_eq!(MessageEnvelope::from_slice(got.as_bytes()).unwrap().id, envelope.id);
        }
        assert_eq!(*h.receipts.calls.lock().await, vec![vec![sent[0].id, sent[1].id]]);

        let key = Harness::key(&c1, "L1");
        assert_eq!(
            queued_ids(&h.queue.flush(&key).await.unwrap()),
            vec![sent[2].id, sent[3].id]
        );
    }

    /// Memory store that runs a hook right before the first delete.
    struct DeleteHookStore {
        inner: courier_store::MemoryStore,
        hook: std::sync::Mutex<Option<futures::future::BoxFuture<'static, ()>>>,
    }

    #[async_trait::async_trait]
    impl KvStore for DeleteHookStore {
        async fn list_push(&self, key: &str, value: &[u8]) -> courier_store::Result<usize> {
            self.inner.list_push(key, value).await
        }
        async fn list_prepend(&self, key: &str, values: &[Bytes]) -> courier_store::Result<usize> {
            self.inner.list_prepend(key, values).await
        }
        async fn list_drain(&self, key: &str) -> courier_store::Result<Vec<Vec<u8>>> {
            self.inner.list_drain(key).await
        }
        async fn list_len(&self, key: &str) -> courier_store::Result<usize> {
            self.inner.list_len(key).await
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> courier_store::Result<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn set(&self, key: &str, value: &str) -> courier_store::Result<()> {
            self.inner.set(key, value).await
        }
        async fn get(&self, key: &str) -> courier_store::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> courier_store::Result<()> {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook.await;
            }
            self.inner.delete(key).await
        }
        async fn ping(&self) -> courier_store::Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_reconnect_during_teardown_stays_online() {
        let h = Harness::new();
        let u1 = Identity::user("U1");
        let inner = courier_store::MemoryStore::new();
        let store = std::sync::Arc::new(DeleteHookStore {
            inner: inner.clone(),
            hook: std::sync::Mutex::new(None),
        });
        let mut ctx = context(&h);
        ctx.presence = PresenceTracker::new(store.clone(), Duration::from_secs(60));

        let (first, _rx_first) = Connection::open(u1.clone(), "L1".into(), 8);
        let first_key = first.key();
        h.hub.register(first).await.unwrap();
        ctx.presence.mark_online(&u1).await.unwrap();

        // A second session for the same identity registers and marks online
        // between the first session's connectivity check and its delete.
        let (second, _rx_second) = Connection::open(u1.clone(), "L1".into(), 8);
        let hub = h.hub.clone();
        let second_presence = PresenceTracker::new(
            std::sync::Arc::new(inner.clone()) as std::sync::Arc<dyn KvStore>,
            Duration::from_secs(60),
        );
        let reconnecting = u1.clone();
        let hook: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
            assert!(hub.register(second).await.unwrap());
            second_presence.mark_online(&reconnecting).await.unwrap();
        });
        *store.hook.lock().unwrap() = Some(hook);

        teardown(&ctx, &first_key).await;

        assert!(store.hook.lock().unwrap().is_none());
        assert!(h.hub.is_connected(&u1).await.unwrap());
        assert!(ctx.presence.is_online(&u1).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_session_releases_relay_feed() {
        let h = Harness::new();
        let ctx = context(&h);
        let l1 = LocationId::from("L1");

        let (session, client) = start(&ctx, Identity::user("U1"));
        let relay = ctx.relay.clone();
        let check = l1.clone();
        eventually(|| {
            let relay = relay.clone();
            let l1 = check.clone();
            async move { relay.is_subscribed(&l1).await }
        })
        .await;

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert!(!ctx.relay.is_subscribed(&l1).await);
    }
}
