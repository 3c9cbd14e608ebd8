//! Synchronous handoff of responses from the connection driver to callers.
//!
//! Every request gets a message ID and one of two slots. Single-response
//! operations use a [`ResponseFuture`](struct.ResponseFuture.html), which is
//! completed exactly once through its [`Completer`](struct.Completer.html).
//! Searches use a [`SearchFuture`](struct.SearchFuture.html), into which the
//! driver pushes entries, references and intermediate responses in arrival
//! order, followed by the terminating SearchResultDone.
//!
//! Both kinds are bounded by a timeout. When the timeout expires, the waiter
//! gets [`ResponseTimeout`](../result/enum.LdapError.html#variant.ResponseTimeout),
//! the operation is cancelled, and an Abandon request is sent to the server.
//!
//! Cancellation is cooperative. `cancel(true)` wakes every blocked waiter
//! with [`OperationCancelled`](../result/enum.LdapError.html#variant.OperationCancelled)
//! and discards any response arriving afterwards. `cancel(false)` only
//! abandons the operation on the server: a response already on its way is
//! still delivered, and waiters which see nothing more get `OperationCancelled`
//! once the driver drops its end of the slot.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ldap::OpSender;
use crate::protocol::{Message, ResponseKind};
use crate::result::{LdapError, Result};
use crate::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Pending,
    Completed,
    Cancelled { interrupted: bool },
}

struct Slot<T> {
    state: State,
    outcome: Option<Result<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().expect("future mutex")
    }
}

fn send_abandon(abandon: &Option<OpSender>, id: RequestId) {
    if let Some(sender) = abandon {
        if let Err(e) = sender.abandon(id) {
            debug!("abandon of operation {} not sent: {}", id, e);
        }
    }
}

/// Single-assignment, timeout-bounded slot for the response to one request.
///
/// Once completed, every call to [`get()`](#method.get) returns the same
/// outcome without blocking.
pub struct ResponseFuture<T> {
    shared: Arc<Shared<T>>,
    id: RequestId,
    timeout: Option<Duration>,
    abandon: Option<OpSender>,
}

/// Producer side of a [`ResponseFuture`](struct.ResponseFuture.html).
///
/// Completion consumes the completer, so a future can't be completed twice.
/// A completer dropped without completing fails its future with
/// `ConnectionClosed`, or `OperationCancelled` if the future was cancelled.
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
    id: RequestId,
}

impl<T: Clone> ResponseFuture<T> {
    /// Create a connected future/completer pair for operation `id`. If `abandon`
    /// is given, cancellation sends an Abandon request through it.
    pub(crate) fn pair(
        id: RequestId,
        timeout: Option<Duration>,
        abandon: Option<OpSender>,
    ) -> (ResponseFuture<T>, Completer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: State::Pending,
                outcome: None,
            }),
            cond: Condvar::new(),
        });
        let future = ResponseFuture {
            shared: shared.clone(),
            id,
            timeout,
            abandon,
        };
        let completer = Completer {
            shared: Some(shared),
            id,
        };
        (future, completer)
    }

    /// Message ID of the operation.
    pub fn message_id(&self) -> RequestId {
        self.id
    }

    /// The timeout applied by [`get()`](#method.get).
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Wait for the outcome, bounded by the operation timeout.
    pub fn get(&self) -> Result<T> {
        self.wait(self.timeout)
    }

    /// Wait for the outcome, bounded by `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait(Some(timeout))
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
        let mut slot = self.shared.lock();
        loop {
            match slot.state {
                State::Completed => {
                    return slot.outcome.clone().unwrap_or(Err(LdapError::ConnectionClosed))
                }
                State::Cancelled { interrupted: true } => {
                    return Err(LdapError::OperationCancelled { id: self.id })
                }
                State::Cancelled { interrupted: false } => {
                    if let Some(outcome) = slot.outcome.clone() {
                        return outcome;
                    }
                }
                State::Pending => (),
            }
            slot = match deadline {
                None => self.shared.cond.wait(slot).expect("future mutex"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if slot.state != State::Pending {
                            return Err(LdapError::OperationCancelled { id: self.id });
                        }
                        drop(slot);
                        if self.cancel(true) {
                            debug!("operation {} timed out", self.id);
                            return Err(LdapError::ResponseTimeout { id: self.id });
                        }
                        self.shared.lock()
                    } else {
                        self.shared
                            .cond
                            .wait_timeout(slot, deadline - now)
                            .expect("future mutex")
                            .0
                    }
                }
            };
        }
    }

    /// Cancel the operation. Returns `true` if the future was pending, in which
    /// case an Abandon request is sent. With `interrupt`, blocked waiters wake up
    /// immediately and any later response is discarded.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let mut slot = self.shared.lock();
        if slot.state != State::Pending {
            return false;
        }
        slot.state = State::Cancelled {
            interrupted: interrupt,
        };
        drop(slot);
        self.shared.cond.notify_all();
        send_abandon(&self.abandon, self.id);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.lock().state, State::Cancelled { .. })
    }

    /// True if the future is completed or cancelled.
    pub fn is_done(&self) -> bool {
        self.shared.lock().state != State::Pending
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T> Completer<T> {
    /// Deliver the outcome. Returns `false` if it was discarded because the
    /// future had been cancelled.
    pub fn complete(mut self, outcome: Result<T>) -> bool {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return false,
        };
        let mut slot = shared.lock();
        let delivered = match slot.state {
            State::Pending => {
                slot.state = State::Completed;
                slot.outcome = Some(outcome);
                true
            }
            State::Cancelled { interrupted: false } if slot.outcome.is_none() => {
                slot.outcome = Some(outcome);
                true
            }
            _ => false,
        };
        drop(slot);
        shared.cond.notify_all();
        if !delivered {
            debug!("discarding late response to operation {}", self.id);
        }
        delivered
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return,
        };
        if let Ok(mut slot) = shared.slot.lock() {
            match slot.state {
                State::Pending => {
                    slot.state = State::Completed;
                    slot.outcome = Some(Err(LdapError::ConnectionClosed));
                }
                State::Cancelled { interrupted: false } if slot.outcome.is_none() => {
                    slot.outcome = Some(Err(LdapError::OperationCancelled { id: self.id }));
                }
                _ => (),
            }
        }
        shared.cond.notify_all();
    }
}

struct Stream {
    state: State,
    queue: VecDeque<Message>,
    failure: Option<LdapError>,
}

struct StreamShared {
    stream: Mutex<Stream>,
    cond: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, Stream> {
        self.stream.lock().expect("search future mutex")
    }
}

/// Ordered, timeout-bounded sequence of responses to one Search request.
///
/// The state is `Completed` once the SearchResultDone has been received;
/// responses already queued remain available until consumed.
pub struct SearchFuture {
    shared: Arc<StreamShared>,
    id: RequestId,
    timeout: Option<Duration>,
    abandon: Option<OpSender>,
}

/// Driver side of a [`SearchFuture`](struct.SearchFuture.html).
pub(crate) struct SearchSink {
    shared: Option<Arc<StreamShared>>,
    id: RequestId,
}

impl SearchFuture {
    pub(crate) fn pair(
        id: RequestId,
        timeout: Option<Duration>,
        abandon: Option<OpSender>,
    ) -> (SearchFuture, SearchSink) {
        let shared = Arc::new(StreamShared {
            stream: Mutex::new(Stream {
                state: State::Pending,
                queue: VecDeque::new(),
                failure: None,
            }),
            cond: Condvar::new(),
        });
        let future = SearchFuture {
            shared: shared.clone(),
            id,
            timeout,
            abandon,
        };
        let sink = SearchSink {
            shared: Some(shared),
            id,
        };
        (future, sink)
    }

    /// Message ID of the Search operation.
    pub fn message_id(&self) -> RequestId {
        self.id
    }

    /// Wait for the next response, bounded by the operation timeout.
    ///
    /// After the SearchResultDone has been returned, further calls fail
    /// with `EndOfStream`.
    pub fn next_response(&self) -> Result<Message> {
        self.next_response_timeout(self.timeout)
    }

    /// Wait for the next response, bounded by `timeout` if given.
    pub fn next_response_timeout(&self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
        let mut stream = self.shared.lock();
        loop {
            if stream.state == (State::Cancelled { interrupted: true }) {
                return Err(LdapError::OperationCancelled { id: self.id });
            }
            if let Some(msg) = stream.queue.pop_front() {
                return Ok(msg);
            }
            if stream.state == State::Completed {
                return Err(LdapError::EndOfStream);
            }
            if let Some(ref failure) = stream.failure {
                return Err(failure.clone());
            }
            stream = match deadline {
                None => self.shared.cond.wait(stream).expect("search future mutex"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if stream.state != State::Pending {
                            return Err(LdapError::OperationCancelled { id: self.id });
                        }
                        drop(stream);
                        if self.cancel(true) {
                            debug!("search {} timed out", self.id);
                            return Err(LdapError::ResponseTimeout { id: self.id });
                        }
                        self.shared.lock()
                    } else {
                        self.shared
                            .cond
                            .wait_timeout(stream, deadline - now)
                            .expect("search future mutex")
                            .0
                    }
                }
            };
        }
    }

    /// Cancel the search. Returns `true` if the search was still in progress,
    /// in which case an Abandon request is sent. With `interrupt`, queued
    /// responses are dropped and blocked waiters wake up immediately.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let mut stream = self.shared.lock();
        if stream.state != State::Pending || stream.failure.is_some() {
            return false;
        }
        stream.state = State::Cancelled {
            interrupted: interrupt,
        };
        if interrupt {
            stream.queue.clear();
        }
        drop(stream);
        self.shared.cond.notify_all();
        send_abandon(&self.abandon, self.id);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.lock().state, State::Cancelled { .. })
    }

    /// True if the search is finished, failed or cancelled.
    pub fn is_done(&self) -> bool {
        let stream = self.shared.lock();
        stream.state != State::Pending || stream.failure.is_some()
    }

    /// Number of responses received but not yet consumed.
    pub fn available(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl fmt::Debug for SearchFuture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SearchFuture")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SearchSink {
    /// Queue a response. Returns `false` if the search is no longer interested,
    /// and the driver should drop the sink.
    pub(crate) fn push(&mut self, msg: Message) -> bool {
        let shared = match self.shared {
            Some(ref shared) => shared,
            None => return false,
        };
        let mut stream = shared.lock();
        let accepted = match stream.state {
            State::Pending | State::Cancelled { interrupted: false } => {
                if msg.kind() == ResponseKind::Done {
                    stream.state = State::Completed;
                }
                stream.queue.push_back(msg);
                true
            }
            _ => false,
        };
        drop(stream);
        shared.cond.notify_all();
        accepted
    }

    /// Fail the search with `err`, unless it's already finished.
    pub(crate) fn fail(mut self, err: LdapError) {
        if let Some(shared) = self.shared.take() {
            let mut stream = shared.lock();
            if stream.state != State::Completed && stream.failure.is_none() {
                stream.failure = Some(err);
            }
            drop(stream);
            shared.cond.notify_all();
        }
    }
}

impl Drop for SearchSink {
    fn drop(&mut self) {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return,
        };
        if let Ok(mut stream) = shared.stream.lock() {
            if stream.failure.is_none() {
                match stream.state {
                    State::Pending => stream.failure = Some(LdapError::ConnectionClosed),
                    State::Cancelled { interrupted: false } => {
                        stream.failure = Some(LdapError::OperationCancelled { id: self.id })
                    }
                    _ => (),
                }
            }
        }
        shared.cond.notify_all();
    }
}
