//! Correlation of outbound frames with the inbound frames that answer them.
//!
//! Every frame the session sends becomes an [`Operation`]. Frames that expect
//! an answer (CONNECT, or anything carrying a `receipt` header) leave a
//! [`PendingOperation`] in the [`Correlator`] until a matching CONNECTED,
//! RECEIPT or ERROR arrives. Frames that expect nothing complete as soon as
//! the transport accepts them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

use crate::error::{Result, ServerError, StompError};
use crate::frame::{Command, Frame};

/// Identifier the correlator assigns to each registered operation.
pub type OperationId = u64;

/// Lifecycle of one operation.
///
/// `Ready -> Executing -> Finished`, with `Cancelled` reachable from either
/// of the first two. `Finished` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationState {
    Ready = 0,
    Executing = 1,
    Finished = 2,
    Cancelled = 3,
}

impl OperationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OperationState::Ready,
            1 => OperationState::Executing,
            2 => OperationState::Finished,
            _ => OperationState::Cancelled,
        }
    }
}

/// Atomic state shared by an operation's handle and its pending entry.
///
/// Completion and cancellation race through compare-and-swap, so exactly one
/// of them wins.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(OperationState::Ready as u8))
    }

    pub(crate) fn get(&self) -> OperationState {
        OperationState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn swap(&self, from: OperationState, to: OperationState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ready -> Executing.
    pub(crate) fn begin(&self) -> bool {
        self.swap(OperationState::Ready, OperationState::Executing)
    }

    fn finish(&self) -> bool {
        self.swap(OperationState::Executing, OperationState::Finished)
            || self.swap(OperationState::Ready, OperationState::Finished)
    }

    fn cancel(&self) -> bool {
        self.swap(OperationState::Ready, OperationState::Cancelled)
            || self.swap(OperationState::Executing, OperationState::Cancelled)
    }
}

/// What inbound frame, if any, completes an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Expectation {
    /// Complete once the transport accepts the frame.
    #[default]
    None,
    /// Complete on the next CONNECTED frame.
    Connected,
    /// Complete on the RECEIPT whose `receipt-id` matches. The key is the
    /// frame's own `receipt` header when present, else the given id, else a
    /// generated `rcpt-<n>` that is injected into the frame.
    Receipt(Option<String>),
}

/// Key under which a pending operation waits for its answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CorrelationKey {
    Connected,
    Receipt(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Connected => f.write_str("CONNECTED"),
            CorrelationKey::Receipt(id) => write!(f, "receipt '{}'", id),
        }
    }
}

type Completion = oneshot::Sender<Result<Option<Frame>>>;

/// Hands a prepared operation's frame to the session for writing.
pub(crate) type Starter = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The session-side half of an operation: its state and completion.
pub struct PendingOperation {
    id: OperationId,
    key: Option<CorrelationKey>,
    state: Arc<StateCell>,
    completion: Completion,
}

impl PendingOperation {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub(crate) fn begin(&self) -> bool {
        self.state.begin()
    }

    /// Deliver the result unless the operation was cancelled first. Returns
    /// whether the completion fired.
    pub fn finish(self, result: Result<Option<Frame>>) -> bool {
        if !self.state.finish() {
            return false;
        }
        match &result {
            Ok(_) => tracing::debug!(operation = self.id, "operation finished"),
            Err(e) => tracing::debug!(operation = self.id, error = %e, "operation failed"),
        }
        // the handle may have been dropped; that is not a failure
        let _ = self.completion.send(result);
        true
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Result of registering an outbound frame.
#[derive(Debug)]
pub struct Registered {
    /// The frame to encode, with any generated `receipt` header added.
    pub frame: Frame,
    pub operation: Operation,
    /// Set when the operation expects no answer. The caller completes it
    /// once the transport accepts the frame.
    pub on_write: Option<PendingOperation>,
}

/// How an inbound frame was matched against the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed(OperationId),
    /// A completion was already cancelled; the frame is a late arrival.
    Discarded(OperationId),
    Unmatched,
}

/// The set of operations waiting for an answer.
///
/// Insertion and match-and-remove both take `&mut self`; the session keeps
/// the correlator behind one mutex so the two never interleave.
#[derive(Debug, Default)]
pub struct Correlator {
    next_id: OperationId,
    next_receipt: u64,
    pending: HashMap<OperationId, PendingOperation>,
    by_key: HashMap<CorrelationKey, OperationId>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_receipt(&mut self) -> String {
        loop {
            let id = format!("rcpt-{}", self.next_receipt);
            self.next_receipt += 1;
            if !self.by_key.contains_key(&CorrelationKey::Receipt(id.clone())) {
                return id;
            }
        }
    }

    /// Register `frame` under `expectation`.
    ///
    /// Fails with `ProtocolViolation` if another pending operation already
    /// claims the same key; nothing is registered in that case.
    pub fn register(&mut self, mut frame: Frame, expectation: Expectation) -> Result<Registered> {
        let key = match expectation {
            Expectation::None => None,
            Expectation::Connected => Some(CorrelationKey::Connected),
            Expectation::Receipt(explicit) => {
                let id = match (frame.get_header("receipt"), explicit) {
                    (Some(existing), _) => existing.to_string(),
                    (None, Some(id)) => id,
                    (None, None) => self.generate_receipt(),
                };
                if frame.get_header("receipt").is_none() {
                    frame = frame.receipt(id.clone());
                }
                Some(CorrelationKey::Receipt(id))
            }
        };

        if let Some(k) = key.as_ref().filter(|k| self.by_key.contains_key(*k)) {
            return Err(StompError::violation(format!(
                "an operation is already waiting for {}",
                k
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        let state = Arc::new(StateCell::new());
        let (tx, rx) = oneshot::channel();
        let receipt_id = match &key {
            Some(CorrelationKey::Receipt(r)) => Some(r.clone()),
            _ => None,
        };
        let pending = PendingOperation {
            id,
            key: key.clone(),
            state: Arc::clone(&state),
            completion: tx,
        };
        let operation = Operation {
            id,
            command: frame.command,
            receipt_id,
            state,
            completion: rx,
            correlator: Weak::new(),
            starter: None,
        };

        let on_write = match key {
            Some(k) => {
                self.by_key.insert(k, id);
                self.pending.insert(id, pending);
                None
            }
            None => Some(pending),
        };

        Ok(Registered {
            frame,
            operation,
            on_write,
        })
    }

    fn take(&mut self, key: &CorrelationKey) -> Option<PendingOperation> {
        let id = self.by_key.remove(key)?;
        self.pending.remove(&id)
    }

    fn complete(&mut self, key: &CorrelationKey, result: Result<Option<Frame>>) -> Resolution {
        match self.take(key) {
            Some(op) => {
                let id = op.id;
                if op.finish(result) {
                    Resolution::Completed(id)
                } else {
                    Resolution::Discarded(id)
                }
            }
            None => Resolution::Unmatched,
        }
    }

    /// Match an inbound CONNECTED, RECEIPT or ERROR frame.
    ///
    /// - CONNECTED completes the pending CONNECT.
    /// - RECEIPT completes the operation whose key equals `receipt-id`.
    /// - ERROR fails the operation named by its `receipt-id`, else the
    ///   pending CONNECT. An ERROR that matches neither is `Unmatched` and is
    ///   the session's to handle.
    pub fn resolve(&mut self, frame: &Frame) -> Resolution {
        match frame.command {
            Command::Connected => {
                self.complete(&CorrelationKey::Connected, Ok(Some(frame.clone())))
            }
            Command::Receipt => match frame.get_header("receipt-id") {
                Some(r) => self.complete(
                    &CorrelationKey::Receipt(r.to_string()),
                    Ok(Some(frame.clone())),
                ),
                None => Resolution::Unmatched,
            },
            Command::Error => {
                let err = StompError::Broker(ServerError::from_frame(frame.clone()));
                let key = frame
                    .get_header("receipt-id")
                    .map(|r| CorrelationKey::Receipt(r.to_string()))
                    .filter(|k| self.by_key.contains_key(k))
                    .unwrap_or(CorrelationKey::Connected);
                self.complete(&key, Err(err))
            }
            _ => Resolution::Unmatched,
        }
    }

    /// Remove a pending entry and fail it with `err`.
    pub fn fail(&mut self, id: OperationId, err: StompError) -> bool {
        match self.pending.remove(&id) {
            Some(op) => {
                if let Some(k) = &op.key {
                    self.by_key.remove(k);
                }
                op.finish(Err(err))
            }
            None => false,
        }
    }

    /// Drop a pending entry without completing it.
    pub fn forget(&mut self, id: OperationId) -> bool {
        match self.pending.remove(&id) {
            Some(op) => {
                if let Some(k) = op.key {
                    self.by_key.remove(&k);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every pending operation, leaving the correlator empty.
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        self.by_key.clear();
        let mut ops: Vec<PendingOperation> = self.pending.drain().map(|(_, op)| op).collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    pub fn is_waiting_for_receipt(&self, receipt_id: &str) -> bool {
        self.by_key
            .contains_key(&CorrelationKey::Receipt(receipt_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Caller-side handle to an in-flight frame.
///
/// An operation from `Session::prepare_operation` stays `Ready` and unsent
/// until [`start`](Self::start). Dropping the handle does not cancel the
/// operation.
pub struct Operation {
    id: OperationId,
    command: Command,
    receipt_id: Option<String>,
    state: Arc<StateCell>,
    completion: oneshot::Receiver<Result<Option<Frame>>>,
    correlator: Weak<Mutex<Correlator>>,
    starter: Option<Starter>,
}

impl Operation {
    pub(crate) fn attach(mut self, correlator: &Arc<Mutex<Correlator>>) -> Self {
        self.correlator = Arc::downgrade(correlator);
        self
    }

    pub(crate) fn with_starter(mut self, starter: Starter) -> Self {
        self.starter = Some(starter);
        self
    }

    /// Queue the frame for writing.
    ///
    /// Fails with `Cancelled` if the operation was cancelled first and with
    /// `ProtocolViolation` if it was already started. A refusal by the
    /// session (wrong state, closed session) also fails the operation itself.
    pub async fn start(&mut self) -> Result<()> {
        let Some(starter) = self.starter.take() else {
            return Err(StompError::violation(format!(
                "operation {} was already started",
                self.id
            )));
        };
        if self.state.get() == OperationState::Cancelled {
            return Err(StompError::Cancelled);
        }
        starter().await
    }

    /// Whether [`start`](Self::start) has yet to be called.
    pub fn is_prepared(&self) -> bool {
        self.starter.is_some()
    }

    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Command of the frame this operation sent.
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn state(&self) -> OperationState {
        self.state.get()
    }

    /// The receipt id this operation waits for, if any.
    pub fn receipt_id(&self) -> Option<&str> {
        self.receipt_id.as_deref()
    }

    /// Wait for the outcome.
    ///
    /// Returns the answering frame (CONNECTED or RECEIPT), `None` for
    /// operations that expected no answer, or the failure. A cancelled
    /// operation yields `StompError::Cancelled`; one that was prepared but
    /// never started is cancelled and yields `ProtocolViolation`.
    pub async fn wait(self) -> Result<Option<Frame>> {
        self.refuse_unstarted().await?;
        if self.state.get() == OperationState::Cancelled {
            return Err(StompError::Cancelled);
        }
        match self.completion.await {
            Ok(result) => result,
            Err(_) => Err(StompError::Cancelled),
        }
    }

    /// Like [`wait`](Self::wait), but cancel the operation and return
    /// `StompError::Timeout` if nothing arrives within `timeout`.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Option<Frame>> {
        self.refuse_unstarted().await?;
        match tokio::time::timeout(timeout, &mut self.completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StompError::Cancelled),
            Err(_) => {
                let label = self.label();
                if self.cancel().await {
                    Err(StompError::Timeout(label))
                } else {
                    // completed between the deadline and the cancel
                    match self.completion.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(StompError::Timeout(label)),
                    }
                }
            }
        }
    }

    /// Cancel the operation. Neither completion will fire afterwards and a
    /// late answer is discarded. Frames already handed to the transport are
    /// not recalled. Returns `false` if the operation had already finished.
    pub async fn cancel(&self) -> bool {
        if !self.state.cancel() {
            return false;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.lock().await.forget(self.id);
        }
        tracing::debug!(operation = self.id, command = %self.command, "operation cancelled");
        true
    }

    async fn refuse_unstarted(&self) -> Result<()> {
        if self.starter.is_none() {
            return Ok(());
        }
        self.cancel().await;
        Err(StompError::violation(format!(
            "operation {} was never started",
            self.id
        )))
    }

    fn label(&self) -> String {
        match &self.receipt_id {
            Some(r) => r.clone(),
            None => self.command.to_string(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("receipt_id", &self.receipt_id)
            .field("state", &self.state.get())
            .field("prepared", &self.starter.is_some())
            .finish()
    }
}
