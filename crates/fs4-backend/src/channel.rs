//! Channel handles and their inboxes.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fs4_packet::{ChannelId, Message, Query, QueryPacketData};

use crate::error::{BackendError, Result};
use crate::mux::Multiplexer;

/// What a channel was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// One request/response exchange tagged with the channel id.
    Request,
    /// Health checks: claims connectionless pongs, reusable for repeated pings.
    Ping,
}

/// Lifecycle of a channel as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Allocated, nothing sent yet.
    Open,
    /// A request went out; replies may be arriving.
    AwaitingResponse,
    /// Closed by the owner or by backend shutdown.
    Closed,
    /// The connection died under the channel.
    Failed(String),
}

#[derive(Debug)]
struct InboxState {
    messages: VecDeque<Message>,
    state: ChannelState,
}

/// Per-channel queue filled by the reader thread and drained by the owner.
#[derive(Debug)]
pub(crate) struct Inbox {
    id: ChannelId,
    inner: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    pub(crate) fn new(id: ChannelId) -> Self {
        Self {
            id,
            inner: Mutex::new(InboxState {
                messages: VecDeque::new(),
                state: ChannelState::Open,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.lock().state.clone()
    }

    pub(crate) fn mark_awaiting(&self) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Open {
            inner.state = ChannelState::AwaitingResponse;
        }
    }

    /// Queue a message. Returns `false` if the channel no longer accepts any.
    pub(crate) fn push(&self, message: Message) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Open | ChannelState::AwaitingResponse => {
                inner.messages.push_back(message);
                drop(inner);
                self.ready.notify_all();
                true
            }
            ChannelState::Closed | ChannelState::Failed(_) => false,
        }
    }

    /// Close and drop undelivered messages, waking any pending receive.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.state = ChannelState::Closed;
        inner.messages.clear();
        drop(inner);
        self.ready.notify_all();
    }

    /// Mark the connection as lost. Messages already queued stay receivable.
    pub(crate) fn fail(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != ChannelState::Closed {
            inner.state = ChannelState::Failed(reason.to_string());
        }
        drop(inner);
        self.ready.notify_all();
    }

    /// Block until at least `min_count` messages are queued, then take all
    /// queued messages.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub(crate) fn receive(&self, timeout: Duration, min_count: usize) -> Result<Vec<Message>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.lock();
        loop {
            if inner.state == ChannelState::Closed {
                return Err(BackendError::InvalidChannel(self.id));
            }
            if inner.messages.len() >= min_count {
                return Ok(inner.messages.drain(..).collect());
            }
            if let ChannelState::Failed(reason) = &inner.state {
                return Err(BackendError::ConnectionLost(reason.clone()));
            }

            let Some(deadline) = deadline else {
                inner = self
                    .ready
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(BackendError::ChannelTimeout {
                    channel: self.id,
                    timeout,
                });
            }
            inner = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().messages.len()
    }
}

/// A logical channel on a backend connection.
///
/// Dropping the handle closes the channel.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    inbox: Arc<Inbox>,
    mux: Arc<Multiplexer>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        inbox: Arc<Inbox>,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            id,
            kind,
            inbox,
            mux,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.inbox.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Messages received but not yet taken by [`Channel::receive`].
    pub fn pending(&self) -> usize {
        self.inbox.pending()
    }

    /// Send a message tagged with this channel.
    ///
    /// Returns `Ok(false)` if the write failed; the connection is then
    /// presumed broken. Fails with `InvalidChannel` once the channel is closed.
    pub fn send(&self, message: &Message) -> Result<bool> {
        self.mux.send(self, message)
    }

    /// Send a query, returning the snapshot [`fs4_packet::GetSummaries`]
    /// needs to fetch summaries for its hits. `Ok(None)` if the write failed.
    pub fn send_query(&self, query: &Query) -> Result<Option<QueryPacketData>> {
        self.mux.send_query(self, query)
    }

    /// Wait up to `timeout` for at least `min_count` messages and return
    /// everything queued.
    pub fn receive(&self, timeout: Duration, min_count: usize) -> Result<Vec<Message>> {
        self.mux.receive(self, timeout, min_count)
    }

    /// Close the channel, freeing its id. Idempotent.
    pub fn close(&self) {
        self.mux.close(self);
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn receive_waits_for_min_count() {
        let inbox = Arc::new(Inbox::new(1));
        let producer = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || {
                for _ in 0..3 {
                    thread::sleep(Duration::from_millis(5));
                    inbox.push(Message::Eol);
                }
            })
        };

        let messages = inbox.receive(Duration::from_secs(5), 3).unwrap();
        assert_eq!(messages.len(), 3);
        producer.join().unwrap();
    }

    #[test]
    fn receive_drains_everything_available() {
        let inbox = Inbox::new(1);
        inbox.push(Message::Eol);
        inbox.push(Message::Eol);
        assert_eq!(inbox.receive(Duration::ZERO, 1).unwrap().len(), 2);
        assert_eq!(inbox.pending(), 0);
    }

    #[test]
    fn timeout_keeps_inbox_intact() {
        let inbox = Inbox::new(7);
        inbox.push(Message::Eol);

        let started = Instant::now();
        let err = inbox.receive(Duration::from_millis(50), 2).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err,
            BackendError::ChannelTimeout { channel: 7, .. }
        ));
        assert_eq!(inbox.pending(), 1);
    }

    #[test]
    fn close_wakes_pending_receive() {
        let inbox = Arc::new(Inbox::new(3));
        let waiter = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || inbox.receive(Duration::from_secs(10), 1))
        };
        thread::sleep(Duration::from_millis(20));
        inbox.close();

        let started = Instant::now();
        let result = waiter.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(result, Err(BackendError::InvalidChannel(3))));
        assert!(!inbox.push(Message::Eol));
    }

    #[test]
    fn failure_delivers_queued_then_reports_loss() {
        let inbox = Inbox::new(4);
        inbox.push(Message::Eol);
        inbox.fail("reset by peer");

        assert_eq!(inbox.receive(Duration::ZERO, 1).unwrap().len(), 1);
        assert!(matches!(
            inbox.receive(Duration::from_secs(1), 1),
            Err(BackendError::ConnectionLost(_))
        ));
        assert_eq!(inbox.state(), ChannelState::Failed("reset by peer".into()));
    }

    #[test]
    fn unbounded_timeout_waits_without_deadline() {
        let inbox = Arc::new(Inbox::new(6));
        inbox.push(Message::Eol);
        assert_eq!(inbox.receive(Duration::MAX, 1).unwrap().len(), 1);

        let waiter = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || inbox.receive(Duration::MAX, 2))
        };
        inbox.push(Message::Eol);
        thread::sleep(Duration::from_millis(20));
        inbox.push(Message::Eol);
        assert_eq!(waiter.join().unwrap().unwrap().len(), 2);

        let waiter = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || inbox.receive(Duration::MAX, 1))
        };
        thread::sleep(Duration::from_millis(20));
        inbox.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(BackendError::InvalidChannel(6))
        ));
    }

    #[test]
    fn awaiting_only_from_open() {
        let inbox = Inbox::new(5);
        inbox.mark_awaiting();
        assert_eq!(inbox.state(), ChannelState::AwaitingResponse);
        inbox.close();
        inbox.mark_awaiting();
        assert_eq!(inbox.state(), ChannelState::Closed);
    }
}
