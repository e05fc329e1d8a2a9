//! Marker-based line demultiplexer.
//!
//! Many request/response conversations share one line stream. Each
//! conversation owns a marker, a literal line prefix. A single reader task
//! pulls every line off the stream and queues it under the longest registered
//! marker it starts with, or under the catch-all empty marker if none matches.
//! Consumers await lines on their marker's queue.
//!
//! Registered non-empty markers are prefix-disjoint, so at most one of them
//! can match a line. When the stream ends (or [`LineSplitter::close`] is
//! called) every pending and future read returns `None` once its queue is
//! drained. A stream that ended on an error keeps it for
//! [`LineSplitter::termination`].

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{Stream, StreamExt};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{ProtocolError, Result};

/// Marker of the catch-all queue.
pub const CATCH_ALL: &str = "";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// FIFO of lines for one marker.
#[derive(Default)]
struct MarkerQueue {
    lines: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MarkerQueue {
    fn push(&self, line: String) {
        lock(&self.lines).push_back(line);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<String> {
        lock(&self.lines).pop_front()
    }
}

/// State shared between the reader task and the handles.
struct Shared {
    markers: Mutex<HashMap<String, Arc<MarkerQueue>>>,
    ended: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        let mut markers = HashMap::new();
        markers.insert(CATCH_ALL.to_string(), Arc::new(MarkerQueue::default()));
        Self {
            markers: Mutex::new(markers),
            ended: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn queue(&self, marker: &str) -> Option<Arc<MarkerQueue>> {
        lock(&self.markers).get(marker).cloned()
    }

    fn route(&self, line: String) {
        let queue = {
            let markers = lock(&self.markers);
            markers
                .iter()
                .filter(|(marker, _)| line.starts_with(marker.as_str()))
                .max_by_key(|(marker, _)| marker.len())
                .map(|(_, queue)| Arc::clone(queue))
        };
        // The catch-all matches every line.
        if let Some(queue) = queue {
            queue.push(line);
        }
    }

    fn end(&self) {
        self.ended.store(true, Ordering::Release);
        for queue in lock(&self.markers).values() {
            queue.notify.notify_waiters();
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

struct Inner {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    started: AtomicBool,
    _guard: DropGuard,
}

/// Routes lines from one stream to per-marker queues.
///
/// Cloning yields another handle to the same queues. The reader task is
/// cancelled when the last handle is dropped.
#[derive(Clone)]
pub struct LineSplitter {
    inner: Arc<Inner>,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSplitter {
    /// Creates a splitter with only the catch-all queue and no reader yet.
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared::new()),
                _guard: cancel.clone().drop_guard(),
                cancel,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a splitter and starts reading `stream` right away.
    pub fn spawn<St, E>(stream: St) -> Self
    where
        St: Stream<Item = std::result::Result<String, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let splitter = Self::new();
        splitter.inner.started.store(true, Ordering::Release);
        splitter.spawn_reader(stream);
        splitter
    }

    /// Starts the reader task on `stream`.
    ///
    /// Register markers before starting to be sure no early line lands in
    /// the catch-all queue. A splitter reads exactly one stream.
    pub fn start<St, E>(&self, stream: St) -> Result<()>
    where
        St: Stream<Item = std::result::Result<String, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::InvalidArgument(
                "splitter is already reading a stream".to_string(),
            ));
        }
        self.spawn_reader(stream);
        Ok(())
    }

    fn spawn_reader<St, E>(&self, stream: St)
    where
        St: Stream<Item = std::result::Result<String, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let shared = Arc::clone(&self.inner.shared);
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            let mut routed: u64 = 0;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Line splitter closed");
                        break;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(line)) => {
                        tracing::trace!(line = %line, "Routing line");
                        shared.route(line);
                        routed += 1;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Line stream failed");
                        *lock(&shared.failure) = Some(e.to_string());
                        break;
                    }
                    None => {
                        tracing::debug!("Line stream ended");
                        break;
                    }
                }
            }
            tracing::debug!(routed, "Line splitter reader stopped");
            shared.end();
        });
    }

    /// Registers a new marker.
    ///
    /// Fails with [`ProtocolError::InvalidArgument`] if `marker` is empty or
    /// if it or an existing marker is a prefix of the other.
    pub fn register_prefix(&self, marker: &str) -> Result<()> {
        if marker.is_empty() {
            return Err(ProtocolError::InvalidArgument(
                "the catch-all marker is always registered".to_string(),
            ));
        }

        let mut markers = lock(&self.inner.shared.markers);
        if let Some(existing) = markers
            .keys()
            .find(|m| !m.is_empty() && (m.starts_with(marker) || marker.starts_with(m.as_str())))
        {
            return Err(ProtocolError::InvalidArgument(format!(
                "marker {:?} conflicts with {:?}",
                marker, existing
            )));
        }
        markers.insert(marker.to_string(), Arc::new(MarkerQueue::default()));
        Ok(())
    }

    /// Registers `marker` unless it already is.
    pub fn ensure_queue(&self, marker: &str) -> Result<()> {
        if self.inner.shared.queue(marker).is_some() {
            return Ok(());
        }
        match self.register_prefix(marker) {
            // Lost a race against another registration of the same marker.
            Err(_) if self.inner.shared.queue(marker).is_some() => Ok(()),
            other => other,
        }
    }

    /// Returns the registered non-empty markers, sorted.
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = lock(&self.inner.shared.markers)
            .keys()
            .filter(|m| !m.is_empty())
            .cloned()
            .collect();
        prefixes.sort();
        prefixes
    }

    /// Awaits the next line for `marker`, with the marker stripped.
    ///
    /// Returns `Ok(None)` once the stream has ended and the queue is empty.
    pub async fn read_line(&self, marker: &str) -> Result<Option<String>> {
        self.read_line_with(marker, true).await
    }

    /// Awaits the next line that matched no marker.
    pub async fn read_unclaimed(&self) -> Result<Option<String>> {
        self.read_line_with(CATCH_ALL, false).await
    }

    /// Awaits the next line for `marker`, optionally keeping the marker.
    pub async fn read_line_with(&self, marker: &str, strip_prefix: bool) -> Result<Option<String>> {
        let queue = self.inner.shared.queue(marker).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!("marker {:?} is not registered", marker))
        })?;

        loop {
            let notified = queue.notify.notified();
            let mut notified = std::pin::pin!(notified);
            // Subscribe before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(line) = queue.pop() {
                if strip_prefix {
                    return Ok(Some(line[marker.len()..].to_string()));
                }
                return Ok(Some(line));
            }
            if self.inner.shared.is_ended() {
                return Ok(None);
            }
            notified.await;
        }
    }

    /// Stops the reader task and ends every queue.
    ///
    /// Lines already queued can still be read.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.shared.end();
    }

    /// Returns whether the stream has ended.
    pub fn is_ended(&self) -> bool {
        self.inner.shared.is_ended()
    }

    /// Returns the error the stream ended with.
    ///
    /// `None` while the stream is open, after a clean end of stream and after
    /// [`close`](Self::close). Lets a consumer whose read returned `None` tell
    /// a closed peer from a failed channel.
    pub fn termination(&self) -> Option<String> {
        lock(&self.inner.shared.failure).clone()
    }
}

impl std::fmt::Debug for LineSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSplitter")
            .field("prefixes", &self.prefixes())
            .field("ended", &self.is_ended())
            .finish()
    }
}
