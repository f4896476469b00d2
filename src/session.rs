use bytes::Bytes;
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::codec::{self, StompItem};
use crate::config::{ConnectOptions, SessionConfig};
use crate::error::{Result, ServerError, StompError};
use crate::frame::{Command, Frame};
use crate::heartbeat::{
    Heartbeat, HeartbeatMonitor, HeartbeatStats, Negotiated, negotiate, parse_heartbeat_header,
};
use crate::operation::{
    Correlator, Expectation, Operation, OperationId, PendingOperation, Resolution, StateCell,
};
use crate::subscription::{MessageHandler, Subscription, SubscriptionOptions, SubscriptionRegistry};
use crate::transport::{TcpTransport, Transport, TransportEvent};

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// CONNECT sent, waiting for CONNECTED.
    Connecting,
    Connected,
    /// DISCONNECT sent, waiting for its RECEIPT.
    Disconnecting,
}

/// Session-level notifications, broadcast to every receiver obtained from
/// [`Session::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport reported that it is open.
    Opened,
    Connected(Frame),
    /// The session ended. `None` for a clean DISCONNECT.
    Disconnected(Option<StompError>),
    BrokerError(ServerError),
    /// A MESSAGE for a subscription id nobody holds.
    Unrouted(Frame),
    /// Inbound bytes that did not decode; the session carried on.
    Malformed(String),
}

struct Inner {
    state: SessionState,
    registry: SubscriptionRegistry,
    monitor: HeartbeatMonitor,
    local_heartbeat: Heartbeat,
    disconnect_receipt: Option<String>,
    /// Set once the event loop has ended; nothing can be sent after that.
    closed: bool,
}

/// State shared between session handles and the event loop.
struct Core {
    inner: Mutex<Inner>,
    correlator: Arc<Mutex<Correlator>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Core {
    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events_tx.send(event);
    }
}

/// How the event loop learns an operation is done with the transport.
enum Tracking {
    /// The operation waits in the correlator for an answer.
    Correlated(Arc<StateCell>),
    /// The operation completes once the frame is written.
    OnWrite(PendingOperation),
}

struct Outbound {
    id: OperationId,
    command: Command,
    bytes: Bytes,
    tracking: Tracking,
}

/// What the event loop should do after handling one event.
enum Step {
    Continue,
    Negotiated(Negotiated),
    Finished,
    Fail(StompError),
}

/// A STOMP session over one transport.
///
/// `Session` is a cheap handle: clones share the same connection. A
/// background task owns the transport and serializes every read, write and
/// timer tick; handles talk to it through a channel and shared state.
///
/// ```ignore
/// let session = Session::connect_tcp("127.0.0.1:61613",
///     ConnectOptions::new().login("guest").passcode("guest")).await?;
/// let (id, _) = session
///     .subscribe("/topic/news", SubscriptionOptions::default(), |m| println!("{}", m))
///     .await?;
/// session.send("/topic/news", b"hello".to_vec()).await?.wait().await?;
/// session.disconnect().await?.wait().await?;
/// ```
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
    outbound_tx: mpsc::Sender<Outbound>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Session {
    /// Open `transport` and start the session's event loop.
    ///
    /// The session starts `Disconnected`; call [`connect`](Self::connect)
    /// to perform the STOMP handshake.
    pub async fn open<T: Transport>(mut transport: T, config: SessionConfig) -> Result<Session> {
        transport.open().await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let core = Arc::new(Core {
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                registry: SubscriptionRegistry::new(),
                monitor: HeartbeatMonitor::new(config.heartbeat_policy),
                local_heartbeat: Heartbeat::disabled(),
                disconnect_receipt: None,
                closed: false,
            }),
            correlator: Arc::new(Mutex::new(Correlator::new())),
            events_tx,
        });
        tokio::spawn(run(transport, Arc::clone(&core), outbound_rx, shutdown_rx));

        Ok(Session {
            core,
            outbound_tx,
            shutdown_tx,
        })
    }

    /// Connect over TCP to `addr` and complete the handshake.
    ///
    /// Returns once CONNECTED has arrived; a broker ERROR or a dropped
    /// connection during the handshake is returned as the error.
    pub async fn connect_tcp(addr: &str, options: ConnectOptions) -> Result<Session> {
        let session = Session::open(TcpTransport::new(addr), SessionConfig::default()).await?;
        if let Err(e) = session.connect(&options).await?.wait().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Send CONNECT. The returned operation completes with the CONNECTED
    /// frame, after which the session is `Connected` and heart-beating.
    pub async fn connect(&self, options: &ConnectOptions) -> Result<Operation> {
        self.send_operation(options.to_frame(), Expectation::Connected)
            .await
    }

    /// SEND `body` to `destination`; completes once written.
    pub async fn send(&self, destination: &str, body: impl Into<Vec<u8>>) -> Result<Operation> {
        self.send_frame(Frame::send(destination, None, body)).await
    }

    /// Send an arbitrary client frame. If it carries a `receipt` header the
    /// operation waits for the matching RECEIPT, otherwise it completes once
    /// written.
    pub async fn send_frame(&self, frame: Frame) -> Result<Operation> {
        let expectation = if frame.command == Command::Connect {
            Expectation::Connected
        } else if frame.get_header("receipt").is_some() {
            Expectation::Receipt(None)
        } else {
            Expectation::None
        };
        self.send_operation(frame, expectation).await
    }

    /// Send `frame` and complete according to `expectation`.
    ///
    /// The frame is checked against the session state and the pending set
    /// before anything is written; a refusal is a `ProtocolViolation` and
    /// leaves the wire untouched. A correlated operation is registered before
    /// its bytes reach the transport.
    pub async fn send_operation(&self, frame: Frame, expectation: Expectation) -> Result<Operation> {
        let mut operation = self.prepare_operation(frame, expectation).await?;
        operation.start().await?;
        Ok(operation)
    }

    /// Build an operation for `frame` without sending it.
    ///
    /// The frame is encoded and its correlation key claimed now, so a
    /// duplicate receipt id is refused here. Nothing reaches the transport
    /// until [`Operation::start`]; the session state is checked at that
    /// point. A prepared operation can be cancelled before it starts.
    pub async fn prepare_operation(&self, frame: Frame, expectation: Expectation) -> Result<Operation> {
        let command = frame.command;
        if self.core.inner.lock().await.closed {
            return Err(StompError::lost("session is closed"));
        }

        let mut correlator = self.core.correlator.lock().await;
        let registered = correlator.register(frame, expectation)?;
        let bytes = match codec::encode(&StompItem::Frame(registered.frame.clone())) {
            Ok(b) => b,
            Err(e) => {
                correlator.forget(registered.operation.id());
                return Err(e);
            }
        };
        drop(correlator);

        let operation = registered.operation.attach(&self.core.correlator);
        let tracking = match registered.on_write {
            Some(pending) => Tracking::OnWrite(pending),
            None => Tracking::Correlated(operation.state_cell()),
        };
        let local_heartbeat = registered
            .frame
            .get_header("heart-beat")
            .map(|v| {
                let (cx, cy) = parse_heartbeat_header(v);
                Heartbeat::new(cx, cy)
            })
            .unwrap_or_else(Heartbeat::disabled);

        let launch = Launch {
            session: self.clone(),
            outbound: Outbound {
                id: operation.id(),
                command,
                bytes,
                tracking,
            },
            receipt_id: operation.receipt_id().map(str::to_string),
            local_heartbeat,
        };
        Ok(operation.with_starter(Box::new(move || Box::pin(launch.run()))))
    }

    /// Subscribe `handler` to `destination`.
    ///
    /// Returns the subscription id (`sub-0`, `sub-1`, ...) and the SUBSCRIBE
    /// operation. The handler is registered before SUBSCRIBE is written, so
    /// no MESSAGE can slip past it. Handlers run on the session task and
    /// must not block.
    pub async fn subscribe<F>(
        &self,
        destination: &str,
        options: SubscriptionOptions,
        handler: F,
    ) -> Result<(String, Operation)>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.subscribe_handler(destination, options, Arc::new(handler))
            .await
    }

    async fn subscribe_handler(
        &self,
        destination: &str,
        options: SubscriptionOptions,
        handler: MessageHandler,
    ) -> Result<(String, Operation)> {
        let target = options.durable_queue.as_deref().unwrap_or(destination);
        let id = {
            let mut inner = self.core.inner.lock().await;
            check_state(inner.state, Command::Subscribe)?;
            inner.registry.subscribe(target, options.ack, handler)
        };

        let mut frame = Frame::subscribe(target, &id, options.ack);
        for (k, v) in &options.headers {
            frame = frame.header(k, v);
        }
        match self.send_frame(frame).await {
            Ok(op) => {
                tracing::debug!(subscription = %id, destination = %target, "subscribed");
                Ok((id, op))
            }
            Err(e) => {
                let _ = self.core.inner.lock().await.registry.unsubscribe(&id);
                Err(e)
            }
        }
    }

    /// Subscribe and receive messages through a channel instead of a
    /// callback.
    pub async fn subscribe_channel(
        &self,
        destination: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = options
            .durable_queue
            .clone()
            .unwrap_or_else(|| destination.to_string());
        let handler: MessageHandler = Arc::new(move |frame| {
            // receiver gone means the caller stopped listening
            let _ = tx.send(frame);
        });
        let (id, _) = self.subscribe_handler(destination, options, handler).await?;
        Ok(Subscription::new(id, target, rx, self.clone()))
    }

    /// Remove a subscription and send UNSUBSCRIBE. MESSAGE frames still in
    /// flight for it are reported as unrouted.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<Operation> {
        let destination = {
            let mut inner = self.core.inner.lock().await;
            check_state(inner.state, Command::Unsubscribe)?;
            inner.registry.unsubscribe(subscription_id)?
        };
        self.send_frame(Frame::unsubscribe(&destination, subscription_id))
            .await
    }

    /// ACK the message whose `ack` header (or `message-id`) is `id`,
    /// optionally inside `transaction`.
    pub async fn ack(&self, id: &str, transaction: Option<&str>) -> Result<Operation> {
        self.send_frame(with_transaction(Frame::ack(id), transaction))
            .await
    }

    pub async fn nack(&self, id: &str, transaction: Option<&str>) -> Result<Operation> {
        self.send_frame(with_transaction(Frame::nack(id), transaction))
            .await
    }

    pub async fn begin(&self, transaction: &str) -> Result<Operation> {
        self.send_frame(Frame::begin(transaction)).await
    }

    pub async fn commit(&self, transaction: &str) -> Result<Operation> {
        self.send_frame(Frame::commit(transaction)).await
    }

    pub async fn abort(&self, transaction: &str) -> Result<Operation> {
        self.send_frame(Frame::abort(transaction)).await
    }

    /// Send DISCONNECT with a receipt. When the RECEIPT arrives the session
    /// becomes `Disconnected`, drops its subscriptions and closes the
    /// transport.
    pub async fn disconnect(&self) -> Result<Operation> {
        self.send_operation(Frame::disconnect(), Expectation::Receipt(None))
            .await
    }

    /// Tear the session down without a DISCONNECT handshake. Pending
    /// operations fail with `ConnectionLost`.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn state(&self) -> SessionState {
        self.core.inner.lock().await.state
    }

    pub async fn heartbeat_stats(&self) -> HeartbeatStats {
        self.core.inner.lock().await.monitor.stats(Instant::now())
    }

    /// Number of operations waiting for an answer.
    pub async fn pending_operations(&self) -> usize {
        self.core.correlator.lock().await.len()
    }

    /// Receiver for session events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events_tx.subscribe()
    }
}

/// A prepared operation waiting for `Operation::start`.
struct Launch {
    session: Session,
    outbound: Outbound,
    receipt_id: Option<String>,
    local_heartbeat: Heartbeat,
}

impl Launch {
    /// Check the session state, apply the state change the frame implies
    /// and queue the frame for the event loop.
    async fn run(self) -> Result<()> {
        let Launch {
            session,
            outbound,
            receipt_id,
            local_heartbeat,
        } = self;
        let core = &session.core;

        let refused = {
            let mut inner = core.inner.lock().await;
            let verdict = if inner.closed {
                Err(StompError::lost("session is closed"))
            } else {
                check_state(inner.state, outbound.command)
            };
            if verdict.is_ok() {
                match outbound.command {
                    Command::Connect => {
                        inner.local_heartbeat = local_heartbeat;
                        transition(&mut inner, SessionState::Connecting);
                    }
                    Command::Disconnect => {
                        inner.disconnect_receipt = receipt_id;
                        transition(&mut inner, SessionState::Disconnecting);
                    }
                    _ => {}
                }
            }
            verdict.err()
        };
        if let Some(e) = refused {
            return Err(abandon(core, outbound, e).await);
        }

        if let Err(mpsc::error::SendError(outbound)) = session.outbound_tx.send(outbound).await {
            return Err(abandon(core, outbound, StompError::lost("session is closed")).await);
        }
        Ok(())
    }
}

/// Fail an operation that never reached the event loop.
async fn abandon(core: &Core, outbound: Outbound, err: StompError) -> StompError {
    match outbound.tracking {
        Tracking::OnWrite(pending) => {
            pending.finish(Err(err.clone()));
        }
        Tracking::Correlated(_) => {
            core.correlator.lock().await.fail(outbound.id, err.clone());
        }
    }
    err
}

fn with_transaction(frame: Frame, transaction: Option<&str>) -> Frame {
    match transaction {
        Some(tx) => frame.header("transaction", tx),
        None => frame,
    }
}

fn check_state(state: SessionState, command: Command) -> Result<()> {
    let allowed = match command {
        Command::Connect => state == SessionState::Disconnected,
        Command::Connected | Command::Message | Command::Receipt | Command::Error => {
            return Err(StompError::violation(format!(
                "{} is a server frame and cannot be sent by a client",
                command
            )));
        }
        _ => state == SessionState::Connected,
    };
    if allowed {
        Ok(())
    } else {
        Err(StompError::violation(format!(
            "cannot send {} while {:?}",
            command, state
        )))
    }
}

fn transition(inner: &mut Inner, to: SessionState) {
    if inner.state != to {
        tracing::info!(from = ?inner.state, to = ?to, "session state change");
        inner.state = to;
    }
}

fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn run<T: Transport>(
    mut transport: T,
    core: Arc<Core>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut heartbeat_tick: Option<Interval> = None;
    let mut liveness_tick: Option<Interval> = None;

    let outcome = loop {
        let step = tokio::select! {
            _ = shutdown_rx.recv() => Step::Fail(StompError::lost("session closed by caller")),
            maybe = outbound_rx.recv() => match maybe {
                Some(out) => write(&mut transport, &core, out).await,
                None => Step::Fail(StompError::lost("all session handles dropped")),
            },
            event = transport.next_event() => match event {
                Some(ev) => on_transport_event(&core, ev).await,
                None => Step::Fail(StompError::lost("transport ended")),
            },
            _ = tick(&mut heartbeat_tick) => emit_heartbeat(&mut transport, &core).await,
            _ = tick(&mut liveness_tick) => {
                match core.inner.lock().await.monitor.check_liveness(Instant::now()) {
                    Ok(()) => Step::Continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "peer stopped heart-beating");
                        Step::Fail(e)
                    }
                }
            }
        };

        match step {
            Step::Continue => {}
            Step::Negotiated(n) => {
                heartbeat_tick = n.outgoing.map(timer);
                liveness_tick = n.incoming.map(|d| timer((d / 2).max(Duration::from_millis(1))));
            }
            Step::Finished => break None,
            Step::Fail(e) => break Some(e),
        }
    };

    teardown(&core, &mut outbound_rx, outcome).await;
    if let Err(e) = transport.close().await {
        tracing::debug!(error = %e, "transport close failed");
    }
}

async fn write<T: Transport>(transport: &mut T, core: &Core, out: Outbound) -> Step {
    let started = match &out.tracking {
        Tracking::Correlated(state) => state.begin(),
        Tracking::OnWrite(pending) => pending.begin(),
    };
    if !started {
        tracing::debug!(operation = out.id, command = %out.command, "skipping cancelled operation");
        let mut inner = core.inner.lock().await;
        match (out.command, inner.state) {
            (Command::Connect, SessionState::Connecting) => {
                transition(&mut inner, SessionState::Disconnected);
            }
            (Command::Disconnect, SessionState::Disconnecting) => {
                inner.disconnect_receipt = None;
                transition(&mut inner, SessionState::Connected);
            }
            _ => {}
        }
        return Step::Continue;
    }
    tracing::debug!(operation = out.id, command = %out.command, "operation started");
    match transport.send(out.bytes).await {
        Ok(()) => {
            tracing::trace!(command = %out.command, "frame written");
            core.inner
                .lock()
                .await
                .monitor
                .record_frame_sent(Instant::now());
            if let Tracking::OnWrite(pending) = out.tracking {
                pending.finish(Ok(None));
            }
            Step::Continue
        }
        Err(e) => {
            tracing::error!(command = %out.command, error = %e, "transport rejected frame");
            if let Tracking::OnWrite(pending) = out.tracking {
                pending.finish(Err(e.clone()));
            }
            Step::Fail(e)
        }
    }
}

async fn emit_heartbeat<T: Transport>(transport: &mut T, core: &Core) -> Step {
    let due = core
        .inner
        .lock()
        .await
        .monitor
        .should_send_heartbeat(Instant::now());
    if !due {
        return Step::Continue;
    }
    match transport.send(Bytes::from_static(b"\n")).await {
        Ok(()) => {
            tracing::trace!("heart-beat sent");
            core.inner
                .lock()
                .await
                .monitor
                .record_heartbeat_sent(Instant::now());
            Step::Continue
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to send heart-beat");
            Step::Fail(e)
        }
    }
}

async fn on_transport_event(core: &Core, event: TransportEvent) -> Step {
    match event {
        TransportEvent::Opened => {
            tracing::debug!("transport opened");
            core.emit(SessionEvent::Opened);
            Step::Continue
        }
        TransportEvent::Message(bytes) => on_message(core, &bytes).await,
        TransportEvent::Closed {
            code,
            reason,
            clean,
        } => {
            tracing::info!(?code, %reason, clean, "transport closed");
            Step::Fail(StompError::lost(format!(
                "transport closed (code {:?}, clean: {}): {}",
                code, clean, reason
            )))
        }
        TransportEvent::Failed(reason) => {
            tracing::error!(%reason, "transport failed");
            Step::Fail(StompError::lost(reason))
        }
    }
}

async fn on_message(core: &Core, bytes: &[u8]) -> Step {
    let now = Instant::now();
    let frame = match codec::decode(bytes) {
        Ok(StompItem::Heartbeat) => {
            tracing::trace!("heart-beat received");
            core.inner.lock().await.monitor.record_heartbeat_received(now);
            return Step::Continue;
        }
        Ok(StompItem::Frame(frame)) => frame,
        Err(e) => {
            tracing::warn!(error = %e, len = bytes.len(), "discarding malformed inbound message");
            let mut inner = core.inner.lock().await;
            inner.monitor.record_frame_received(now);
            if inner.state == SessionState::Connecting {
                return Step::Fail(e);
            }
            drop(inner);
            core.emit(SessionEvent::Malformed(e.to_string()));
            return Step::Continue;
        }
    };

    let mut inner = core.inner.lock().await;
    inner.monitor.record_frame_received(now);

    match frame.command {
        Command::Message => {
            let handler = inner.registry.handler_for(&frame);
            drop(inner);
            match handler {
                Some(handler) => handler(frame),
                None => {
                    tracing::warn!(
                        subscription = frame.get_header("subscription").unwrap_or(""),
                        destination = frame.get_header("destination").unwrap_or(""),
                        "dropping MESSAGE for unknown subscription"
                    );
                    core.emit(SessionEvent::Unrouted(frame));
                }
            }
            Step::Continue
        }
        Command::Connected => {
            if inner.state != SessionState::Connecting {
                tracing::debug!(state = ?inner.state, "ignoring unsolicited CONNECTED");
                return Step::Continue;
            }
            let peer = frame
                .get_header("heart-beat")
                .map(|v| {
                    let (sx, sy) = parse_heartbeat_header(v);
                    Heartbeat::new(sx, sy)
                })
                .unwrap_or_else(Heartbeat::disabled);
            let negotiated = negotiate(inner.local_heartbeat, peer);
            inner.monitor.start(negotiated, now);
            transition(&mut inner, SessionState::Connected);
            tracing::info!(
                version = frame.get_header("version").unwrap_or("1.0"),
                outgoing = ?negotiated.outgoing,
                incoming = ?negotiated.incoming,
                "connected"
            );
            core.correlator.lock().await.resolve(&frame);
            drop(inner);
            core.emit(SessionEvent::Connected(frame));
            Step::Negotiated(negotiated)
        }
        Command::Receipt => {
            let receipt_id = frame.get_header("receipt-id").map(str::to_string);
            let is_disconnect =
                receipt_id.is_some() && receipt_id == inner.disconnect_receipt;
            if is_disconnect {
                transition(&mut inner, SessionState::Disconnected);
            }
            let resolution = core.correlator.lock().await.resolve(&frame);
            if resolution == Resolution::Unmatched {
                tracing::debug!(receipt = ?receipt_id, "discarding unsolicited RECEIPT");
            }
            if is_disconnect {
                Step::Finished
            } else {
                Step::Continue
            }
        }
        Command::Error => {
            let err = ServerError::from_frame(frame.clone());
            tracing::warn!(message = %err.message, receipt = ?err.receipt_id, "broker sent ERROR");
            if inner.state == SessionState::Disconnected {
                drop(inner);
                core.emit(SessionEvent::BrokerError(err));
                return Step::Continue;
            }
            let resolution = core.correlator.lock().await.resolve(&frame);
            drop(inner);
            if resolution == Resolution::Unmatched {
                tracing::debug!("ERROR not attributable to a pending operation");
            }
            core.emit(SessionEvent::BrokerError(err.clone()));
            Step::Fail(StompError::Broker(err))
        }
        other => {
            tracing::debug!(command = %other, "discarding unexpected inbound frame");
            Step::Continue
        }
    }
}

async fn teardown(
    core: &Core,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    reason: Option<StompError>,
) {
    let pending = {
        let mut inner = core.inner.lock().await;
        inner.closed = true;
        inner.disconnect_receipt = None;
        inner.registry.clear();
        transition(&mut inner, SessionState::Disconnected);
        core.correlator.lock().await.drain()
    };

    let op_error = match &reason {
        Some(StompError::Broker(e)) => {
            StompError::lost(format!("session ended by broker error: {}", e.message))
        }
        Some(e) => e.clone(),
        None => StompError::lost("session disconnected"),
    };
    for op in pending {
        op.finish(Err(op_error.clone()));
    }
    outbound_rx.close();
    while let Ok(out) = outbound_rx.try_recv() {
        if let Tracking::OnWrite(pending) = out.tracking {
            pending.finish(Err(op_error.clone()));
        }
    }

    match &reason {
        Some(e) => tracing::warn!(error = %e, "session terminated"),
        None => tracing::info!("session disconnected"),
    }
    core.emit(SessionEvent::Disconnected(reason));
}
