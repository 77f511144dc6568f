//! Read transactions and the background reaper.
//!
//! A read transaction pins the root published at the time it was opened;
//! every page reachable from that root stays valid for as long as the
//! transaction is alive, whatever writers do in the meantime. Transactions
//! are registered in a shared FIFO so a background reaper can expire the
//! ones readers forgot to close.

use crate::page::Page;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A snapshot handle: the pinned root, the revision it was published
/// under, the creation timestamp the reaper judges it by, and the closed
/// flag.
pub struct ReadTransaction<K, V> {
    root: Arc<Page<K, V>>,
    revision: u64,
    created: Instant,
    closed: AtomicBool,
}

impl<K, V> ReadTransaction<K, V> {
    pub(crate) fn new(root: Arc<Page<K, V>>, revision: u64) -> Self {
        ReadTransaction {
            root,
            revision,
            created: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// The root this transaction pins.
    pub(crate) fn root(&self) -> &Arc<Page<K, V>> {
        &self.root
    }

    /// Revision the pinned root was published under.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the transaction. Pages already handed to a cursor remain
    /// valid until the cursor is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn expired(&self, timeout: Duration) -> bool {
        self.created.elapsed() > timeout
    }
}

/// Shared FIFO of open read transactions, oldest first.
pub(crate) struct TransactionManager<K, V> {
    queue: Mutex<VecDeque<Arc<ReadTransaction<K, V>>>>,
}

impl<K, V> TransactionManager<K, V> {
    pub(crate) fn new() -> Self {
        TransactionManager {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Opens a transaction pinning `root` and registers it in the FIFO.
    pub(crate) fn begin(
        &self,
        root: Arc<Page<K, V>>,
        revision: u64,
    ) -> Arc<ReadTransaction<K, V>> {
        let transaction = Arc::new(ReadTransaction::new(root, revision));
        self.queue.lock().unwrap().push_back(transaction.clone());
        transaction
    }

    /// Drops closed and expired transactions from the head of the FIFO.
    /// Creation order lets the walk stop at the first live, unexpired
    /// entry. Returns how many were reaped.
    pub(crate) fn reap(&self, timeout: Duration) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let mut reaped = 0;
        while let Some(front) = queue.front() {
            if front.is_closed() || front.expired(timeout) {
                front.close();
                queue.pop_front();
                reaped += 1;
            } else {
                break;
            }
        }
        reaped
    }

    /// Closes and drops every registered transaction.
    pub(crate) fn release_all(&self) {
        let mut queue = self.queue.lock().unwrap();
        for transaction in queue.iter() {
            transaction.close();
        }
        queue.clear();
    }

    /// Number of registered (possibly already closed) transactions.
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Starts the reaper thread: sleep one timeout, reap, repeat. A message
/// on (or disconnection of) the shutdown channel releases every pinned
/// transaction and stops the thread.
pub(crate) fn spawn_reaper<K, V>(
    manager: Arc<TransactionManager<K, V>>,
    timeout: Duration,
    shutdown: Receiver<()>,
) -> JoinHandle<()>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || loop {
            match shutdown.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    let reaped = manager.reap(timeout);
                    if reaped > 0 {
                        debug!("reaped {} expired read transactions", reaped);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    manager.release_all();
                    return;
                }
            }
        })
        .expect("failed to spawn reaper thread")
}
