//! Serialized contact resolution.
//!
//! Protocol events that need a contact lookup arrive faster than lookups
//! complete, and lookup latency varies per request. [`ContactResolutionQueue`]
//! funnels every request through a single worker so that results come back in
//! exactly the order the requests were enqueued, with at most one directory
//! call outstanding at a time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TubeError;
use crate::traits::ContactDirectory;
use crate::types::{ContactRef, HandleId};

/// Opaque identifier correlating a resolution result with its request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(Uuid);

impl RequestToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One batch of handles waiting to be resolved.
///
/// An empty batch is an ordering barrier: it resolves to nothing but keeps its
/// place in line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleRequest {
    pub token: RequestToken,
    pub handles: Vec<HandleId>,
}

impl HandleRequest {
    pub fn is_barrier(&self) -> bool {
        self.handles.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    /// The request identified by `token` finished. A failed lookup is
    /// reported as `Err` rather than folded into an empty list.
    Resolved {
        token: RequestToken,
        contacts: Result<Vec<ContactRef>, TubeError>,
    },
    /// Every enqueued request has been delivered.
    Drained,
}

/// FIFO of contact lookups with a single worker.
///
/// Must be created inside a tokio runtime. Dropping the queue cancels the
/// worker; a lookup in flight at that point is abandoned and its result never
/// delivered.
pub struct ContactResolutionQueue {
    requests: mpsc::UnboundedSender<HandleRequest>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ContactResolutionQueue {
    pub fn new(
        directory: Arc<dyn ContactDirectory>,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let worker = QueueWorker {
            directory,
            requests: request_rx,
            events: event_tx,
            queued: queued.clone(),
            in_flight: in_flight.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());

        let queue = Self {
            requests: request_tx,
            queued,
            in_flight,
            cancel,
        };
        (queue, event_rx)
    }

    /// Append a request and return its token. Never blocks.
    ///
    /// The caller must record the token before yielding to the runtime; the
    /// result cannot be delivered earlier than that.
    pub fn enqueue(&self, handles: Vec<HandleId>) -> RequestToken {
        let request = HandleRequest {
            token: RequestToken::generate(),
            handles,
        };
        let token = request.token;

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.requests.send(request).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            log::debug!("contact queue: worker stopped, request {} dropped", token);
        }
        token
    }

    /// `true` while a directory lookup is outstanding.
    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Requests waiting behind the one being processed.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        !self.is_processing() && self.pending() == 0
    }
}

impl Drop for ContactResolutionQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct QueueWorker {
    directory: Arc<dyn ContactDirectory>,
    requests: mpsc::UnboundedReceiver<HandleRequest>,
    events: mpsc::UnboundedSender<QueueEvent>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl QueueWorker {
    async fn run(mut self) {
        loop {
            let request = match self.requests.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        next = self.requests.recv() => match next {
                            Some(request) => request,
                            None => break,
                        },
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            // in_flight goes up before queued goes down so is_idle() never
            // sees a gap between the two.
            self.in_flight.store(true, Ordering::SeqCst);
            self.queued.fetch_sub(1, Ordering::SeqCst);

            let contacts = if request.is_barrier() {
                Ok(Vec::new())
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    result = self.directory.contacts_for_handles(&request.handles) => result,
                }
            };

            if let Err(err) = &contacts {
                log::warn!(
                    "contact queue: lookup for {:?} (request {}) failed: {}",
                    request.handles,
                    request.token,
                    err
                );
            }

            let resolved = QueueEvent::Resolved {
                token: request.token,
                contacts,
            };
            let delivered = self.events.send(resolved).is_ok();
            self.in_flight.store(false, Ordering::SeqCst);
            if !delivered {
                break;
            }

            let drained = self.queued.load(Ordering::SeqCst) == 0;
            if drained && self.events.send(QueueEvent::Drained).is_err() {
                break;
            }
        }
        self.in_flight.store(false, Ordering::SeqCst);
        log::trace!("contact queue: worker stopped");
    }
}
