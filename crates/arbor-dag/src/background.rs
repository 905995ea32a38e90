//! Write-behind decorator for [`NodeStore`]s.
//!
//! Puts are queued to one dedicated writer thread and return immediately.
//! The first read after a run of puts stops the writer and waits for it to
//! drain, so reads always observe every accepted put. A failure on the
//! writer thread is held until that drain point and reported there.
//!
//! Not safe for concurrent producers: the store has a single writer, which
//! `&mut self` enforces.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use arbor_types::NodeId;

use crate::error::{DagError, DagResult};
use crate::node::DagNode;
use crate::storage::NodeStore;

const WRITER_THREAD_NAME: &str = "node-store-writer";

enum Message {
    Put(BTreeMap<NodeId, DagNode>),
    Stop,
}

struct Worker {
    sender: Sender<Message>,
    handle: JoinHandle<()>,
}

enum Mode {
    Init,
    Writing(Worker),
    Reading,
    Closed,
}

pub struct BackgroundingNodeStore<S: NodeStore + 'static> {
    inner: Arc<Mutex<S>>,
    mode: Mode,
    capacity: usize,
    failure: Arc<Mutex<Option<DagError>>>,
    dead: Arc<AtomicBool>,
}

impl<S: NodeStore + 'static> BackgroundingNodeStore<S> {
    /// Wrap `inner`, queueing at most `capacity` pending batches.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            mode: Mode::Init,
            capacity: capacity.max(1),
            failure: Arc::new(Mutex::new(None)),
            dead: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a writer thread is currently running.
    pub fn is_writing(&self) -> bool {
        matches!(self.mode, Mode::Writing(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.mode, Mode::Closed)
    }

    fn check_open(&self) -> DagResult<()> {
        if self.is_closed() {
            Err(DagError::Closed)
        } else {
            Ok(())
        }
    }

    fn spawn_writer(&mut self) -> DagResult<()> {
        let (sender, receiver) = channel::bounded::<Message>(self.capacity);
        let inner = Arc::clone(&self.inner);
        let failure = Arc::clone(&self.failure);
        let dead = Arc::clone(&self.dead);
        dead.store(false, Ordering::Release);

        let handle = thread::Builder::new()
            .name(WRITER_THREAD_NAME.into())
            .spawn(move || {
                debug!("node store writer started");
                for message in receiver.iter() {
                    match message {
                        Message::Put(nodes) => {
                            if let Err(err) = inner.lock().put_all(nodes) {
                                debug!(error = %err, "node store writer failed");
                                *failure.lock() = Some(err);
                                dead.store(true, Ordering::Release);
                                break;
                            }
                        }
                        Message::Stop => break,
                    }
                }
                // Dropping the receiver here discards queued batches and
                // unblocks a producer waiting on a full queue.
                debug!("node store writer stopped");
            })?;

        self.mode = Mode::Writing(Worker { sender, handle });
        Ok(())
    }

    /// Stop the writer, wait for it, and report what it failed on.
    fn drain(&mut self) -> DagResult<()> {
        if self.is_writing() {
            if let Mode::Writing(Worker { sender, handle }) =
                std::mem::replace(&mut self.mode, Mode::Reading)
            {
                if sender.send(Message::Stop).is_err() {
                    debug!("node store writer already stopped");
                }
                drop(sender);
                if handle.join().is_err() {
                    return Err(DagError::WorkerPanicked);
                }
            }
        }
        if let Some(err) = self.failure.lock().take() {
            self.dead.store(false, Ordering::Release);
            return Err(DagError::WorkerFailed(Box::new(err)));
        }
        Ok(())
    }
}

impl<S: NodeStore + 'static> NodeStore for BackgroundingNodeStore<S> {
    fn put_all(&mut self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        self.check_open()?;
        if nodes.is_empty() {
            return Ok(());
        }
        if self.dead.load(Ordering::Acquire) {
            self.drain()?;
        }
        if !self.is_writing() {
            self.spawn_writer()?;
        }
        let Mode::Writing(worker) = &self.mode else {
            return Err(DagError::Closed);
        };
        if let Err(channel::SendError(Message::Put(nodes))) = worker.sender.send(Message::Put(nodes)) {
            // The writer exited between the liveness check and the send.
            self.drain()?;
            return self.inner.lock().put_all(nodes);
        }
        Ok(())
    }

    fn get(&mut self, id: &NodeId) -> DagResult<Option<DagNode>> {
        self.check_open()?;
        self.drain()?;
        self.inner.lock().get(id)
    }

    fn get_all(&mut self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        self.check_open()?;
        self.drain()?;
        self.inner.lock().get_all(ids)
    }

    fn len(&mut self) -> DagResult<usize> {
        self.check_open()?;
        self.drain()?;
        self.inner.lock().len()
    }

    fn flush(&mut self) -> DagResult<()> {
        self.check_open()?;
        self.drain()?;
        self.inner.lock().flush()
    }

    fn close(&mut self) -> DagResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let drained = self.drain();
        self.mode = Mode::Closed;
        let closed = self.inner.lock().close();
        drained.and(closed)
    }
}

impl<S: NodeStore + 'static> Drop for BackgroundingNodeStore<S> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "closing node store on drop");
        }
    }
}

impl<S: NodeStore + 'static> std::fmt::Debug for BackgroundingNodeStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Init => "init",
            Mode::Writing(_) => "writing",
            Mode::Reading => "reading",
            Mode::Closed => "closed",
        };
        f.debug_struct("BackgroundingNodeStore")
            .field("mode", &mode)
            .field("capacity", &self.capacity)
            .finish()
    }
}
