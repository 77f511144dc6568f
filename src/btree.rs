//! The B+Tree engine: root publication, write serialization and the
//! public store contract.
//!
//! One writer at a time mutates the tree under the writer lock, building a
//! new root by copy-on-write and swapping the published root pointer while
//! still holding the lock. Readers never take that lock: they clone the
//! published root under a brief read lock and traverse immutable pages.
//! Mutations are journaled by a background thread; `flush` checkpoints the
//! current snapshot to disk and retires the journal.

use crate::checkpoint;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::journal::{self, Journal, Modification};
use crate::page::{DeleteAction, InsertAction, Node, Page, PageCtx, Tuple};
use crate::serializer::Serializer;
use crate::transaction::{spawn_reaper, ReadTransaction, TransactionManager};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Page size used when none (or a degenerate one) is configured.
pub const DEFAULT_PAGE_SIZE: usize = 16;

/// How long an unclosed read transaction survives before the reaper
/// expires it.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    path: Option<PathBuf>,
    page_size: usize,
    read_timeout: Duration,
    allow_duplicates: bool,
}

impl StoreConfig {
    /// A persistent store rooted at `path`. If no file exists there yet,
    /// the data file is created as `⟨path⟩.data`; the journal lives
    /// alongside it with a `.log` extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: Some(path.into()),
            page_size: DEFAULT_PAGE_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            allow_duplicates: false,
        }
    }

    /// A volatile store: no data file, no journal, nothing survives the
    /// process.
    pub fn in_memory() -> Self {
        StoreConfig {
            path: None,
            page_size: DEFAULT_PAGE_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            allow_duplicates: false,
        }
    }

    /// Sets the page size. Values of 2 or less fall back to the default;
    /// everything else rounds up to the next power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = coerce_page_size(page_size);
        self
    }

    /// Sets the read-transaction timeout enforced by the reaper.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Allows several values under one key: inserting an existing key
    /// appends instead of replacing.
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }
}

fn coerce_page_size(page_size: usize) -> usize {
    if page_size <= 2 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size.next_power_of_two()
    }
}

/// Shape statistics for one snapshot of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Stored (key, value) pairs.
    pub nb_elems: u64,
    /// Revision of the published root.
    pub revision: u64,
    /// Internal levels above the leaves; a lone root leaf is depth 0.
    pub depth: usize,
    pub page_count: usize,
    pub leaf_count: usize,
    pub node_count: usize,
}

/// An ordered key-value store over a copy-on-write B+Tree.
///
/// All operations take `&self`; the engine is safe to share behind an
/// `Arc` across threads. One writer mutates at a time, any number of
/// readers traverse stable snapshots concurrently.
pub struct BTree<K, V> {
    key_ser: Arc<dyn Serializer<K>>,
    value_ser: Arc<dyn Serializer<V>>,
    page_size: usize,
    allow_duplicates: bool,

    /// Published root. Readers clone the `Arc` under a brief read lock;
    /// the writer swaps it under the write lock while holding
    /// `write_lock`.
    root: RwLock<Arc<Page<K, V>>>,
    /// Serializes mutations; held across root publication.
    write_lock: Mutex<()>,

    revision: AtomicU64,
    record_ids: AtomicU64,
    nb_elems: AtomicU64,
    closed: AtomicBool,

    transactions: Arc<TransactionManager<K, V>>,

    data_path: Option<PathBuf>,
    /// Engine-side journal handle, used only to reset it on checkpoint.
    journal: Option<Mutex<Journal>>,
    journal_tx: Option<Sender<Modification<K, V>>>,
    journal_thread: Option<JoinHandle<()>>,
    reaper_tx: Option<Sender<()>>,
    reaper_thread: Option<JoinHandle<()>>,
}

impl<K, V> BTree<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Opens a store: loads the data file if one exists, replays and
    /// truncates the journal, then starts the background journal writer
    /// and transaction reaper.
    pub fn open(
        config: StoreConfig,
        key_ser: Arc<dyn Serializer<K>>,
        value_ser: Arc<dyn Serializer<V>>,
    ) -> Result<BTree<K, V>> {
        let page_size = coerce_page_size(config.page_size);
        let mut tree = BTree {
            key_ser,
            value_ser,
            page_size,
            allow_duplicates: config.allow_duplicates,
            root: RwLock::new(Page::new_leaf(0, 0)),
            write_lock: Mutex::new(()),
            revision: AtomicU64::new(0),
            record_ids: AtomicU64::new(1),
            nb_elems: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            transactions: Arc::new(TransactionManager::new()),
            data_path: None,
            journal: None,
            journal_tx: None,
            journal_thread: None,
            reaper_tx: None,
            reaper_thread: None,
        };

        if let Some(path) = &config.path {
            let data_path = resolve_data_path(path);
            tree.recover(&data_path)?;

            let journal_path = journal::journal_path(&data_path);
            let mut engine_journal = Journal::open(&journal_path)?;
            engine_journal.truncate()?;

            let (tx, rx) = mpsc::channel();
            let writer_journal = Journal::open(&journal_path)?;
            tree.journal_thread = Some(journal::spawn_writer(
                rx,
                writer_journal,
                tree.key_ser.clone(),
                tree.value_ser.clone(),
            ));
            tree.journal_tx = Some(tx);
            tree.journal = Some(Mutex::new(engine_journal));
            tree.data_path = Some(data_path);
        }

        let (reaper_tx, reaper_rx) = mpsc::channel();
        tree.reaper_thread = Some(spawn_reaper(
            tree.transactions.clone(),
            config.read_timeout,
            reaper_rx,
        ));
        tree.reaper_tx = Some(reaper_tx);

        Ok(tree)
    }

    /// Rebuilds the tree from the data file, then replays the journal on
    /// top of it. Neither step journals: the journal is truncated right
    /// after, once its records live in the tree.
    fn recover(&self, data_path: &Path) -> Result<()> {
        if data_path.exists() && std::fs::metadata(data_path)?.len() > 0 {
            let loaded = checkpoint::load_snapshot(
                data_path,
                &*self.key_ser,
                &*self.value_ser,
                |key, value| {
                    self.apply_insert(key, value, false);
                    Ok(())
                },
            )?;
            info!("loaded {} entries from {}", loaded, data_path.display());
        }

        let journal_path = journal::journal_path(data_path);
        if journal::has_records(&journal_path) {
            let replayed = journal::replay(
                &journal_path,
                &*self.key_ser,
                &*self.value_ser,
                |modification| {
                    match modification {
                        Modification::Addition(key, value) => {
                            self.apply_insert(key, value, false);
                        }
                        Modification::Deletion(key) => {
                            self.apply_delete(&key, None, false);
                        }
                        Modification::Poison => {}
                    }
                    Ok(())
                },
            )?;
            info!("replayed {} journal records", replayed);
        }

        Ok(())
    }

    /// Inserts a (key, value) pair. Returns the replaced value when the
    /// key already existed, `None` on a fresh insert (or on a
    /// duplicate-mode append).
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.ensure_open()?;
        Ok(self.apply_insert(key, value, true))
    }

    /// Removes a key and every value stored under it. Returns the key
    /// with its first value, or `None` when the key is absent.
    pub fn delete(&self, key: &K) -> Result<Option<Tuple<K, V>>> {
        self.ensure_open()?;
        Ok(self.apply_delete(key, None, true))
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &K) -> Result<V> {
        self.ensure_open()?;
        let transaction = self.begin_read();
        let result = transaction
            .root()
            .find_value(&self.ctx(), key)
            .map(|holder| holder.first().clone());
        transaction.close();
        result.ok_or(Error::KeyNotFound)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        let transaction = self.begin_read();
        let found = transaction.root().find_value(&self.ctx(), key).is_some();
        transaction.close();
        Ok(found)
    }

    /// A cursor over the whole key range, in ascending order.
    pub fn browse(&self) -> Result<Cursor<K, V>> {
        self.ensure_open()?;
        let transaction = self.begin_read();
        let mut stack = Vec::new();
        transaction.root().browse_first(&mut stack);
        Ok(Cursor::new(transaction, stack))
    }

    /// A cursor positioned on `key`, or on the first key greater than it.
    pub fn browse_from(&self, key: &K) -> Result<Cursor<K, V>> {
        self.ensure_open()?;
        let transaction = self.begin_read();
        let mut stack = Vec::new();
        transaction
            .root()
            .browse_from(&self.ctx(), key, &mut stack);
        Ok(Cursor::new(transaction, stack))
    }

    /// Checkpoints the current snapshot to the data file and truncates
    /// the journal. A no-op for in-memory stores.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.checkpoint()
    }

    /// Stops the reaper, drains and stops the journal writer, performs a
    /// final checkpoint and clears the root. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_threads();
        self.checkpoint()?;

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let record_id = self.record_ids.fetch_add(1, Ordering::SeqCst);
        *self.root.write().unwrap() = Page::new_leaf(revision, record_id);
        self.nb_elems.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Stored (key, value) pairs reachable from the published root.
    pub fn len(&self) -> u64 {
        self.nb_elems.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revision of the most recent mutation.
    pub fn revision(&self) -> u64 {
        self.root.read().unwrap().revision()
    }

    /// Page size the tree was opened with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Shape statistics for the current snapshot.
    pub fn stats(&self) -> TreeStats {
        let root = self.root.read().unwrap().clone();
        let mut stats = TreeStats {
            nb_elems: self.len(),
            revision: root.revision(),
            depth: 0,
            page_count: 0,
            leaf_count: 0,
            node_count: 0,
        };
        stats.depth = collect_stats(&root, &mut stats);
        stats
    }

    /// Opens a read transaction pinning the published root.
    fn begin_read(&self) -> Arc<ReadTransaction<K, V>> {
        let root = self.root.read().unwrap().clone();
        // The revision is recorded for diagnostics; the pinned root alone
        // carries the snapshot.
        let revision = self.revision.load(Ordering::SeqCst);
        self.transactions.begin(root, revision)
    }

    fn ctx(&self) -> PageCtx<'_, K> {
        PageCtx {
            key_ser: &*self.key_ser,
            record_ids: &self.record_ids,
            page_size: self.page_size,
            allow_duplicates: self.allow_duplicates,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument("tree is closed".to_string()));
        }
        Ok(())
    }

    /// The mutation path for inserts: under the writer lock, rewrite the
    /// affected pages at a fresh revision, publish the new root, then
    /// enqueue the journal record.
    fn apply_insert(&self, key: K, value: V, journal: bool) -> Option<V> {
        let _guard = self.write_lock.lock().unwrap();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.ctx();

        let record = (journal && self.journal_tx.is_some())
            .then(|| (key.clone(), value.clone()));

        let root = self.root.read().unwrap().clone();
        let (new_root, previous) = match root.insert(&ctx, revision, key, value) {
            InsertAction::Modified { page, previous } => (page, previous),
            InsertAction::Split { pivot, left, right } => {
                let record_id = self.record_ids.fetch_add(1, Ordering::SeqCst);
                let root = Node::new(revision, record_id, vec![pivot], vec![left, right]);
                (Arc::new(Page::Node(root)), None)
            }
        };

        *self.root.write().unwrap() = new_root;
        if previous.is_none() {
            self.nb_elems.fetch_add(1, Ordering::SeqCst);
        }

        if let Some((key, value)) = record {
            self.enqueue(Modification::Addition(key, value));
        }
        previous
    }

    /// The mutation path for deletes. `value_filter` narrows the removal
    /// to one matching value; without it the whole entry goes.
    fn apply_delete(
        &self,
        key: &K,
        value_filter: Option<&dyn Fn(&V) -> bool>,
        journal: bool,
    ) -> Option<Tuple<K, V>> {
        let _guard = self.write_lock.lock().unwrap();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.ctx();

        let root = self.root.read().unwrap().clone();
        match root.delete(&ctx, revision, key, value_filter, None) {
            DeleteAction::NotPresent => None,
            DeleteAction::Removed {
                page,
                tuple,
                removed,
                ..
            } => {
                // An internal root left without separators collapses onto
                // its surviving child.
                let new_root = if !page.is_leaf() && page.nb_elems() == 0 {
                    page.children().unwrap()[0].clone()
                } else {
                    page
                };

                *self.root.write().unwrap() = new_root.clone();
                self.nb_elems.fetch_sub(removed as u64, Ordering::SeqCst);

                if journal && self.journal_tx.is_some() {
                    self.enqueue(Modification::Deletion(key.clone()));
                    if value_filter.is_some() {
                        // The journal format only deletes by key: re-assert
                        // the values the targeted delete left in place so a
                        // replay reproduces the exact state.
                        if let Some(holder) = new_root.find_value(&ctx, key) {
                            for i in 0..holder.len() {
                                self.enqueue(Modification::Addition(
                                    key.clone(),
                                    holder.get(i).clone(),
                                ));
                            }
                        }
                    }
                }
                Some(tuple)
            }
            DeleteAction::Borrowed { .. } | DeleteAction::Merged { .. } => {
                unreachable!("the root has no sibling to rebalance with")
            }
        }
    }

    fn enqueue(&self, modification: Modification<K, V>) {
        if let Some(tx) = &self.journal_tx {
            if tx.send(modification).is_err() {
                warn!("journal writer is gone; record dropped");
            }
        }
    }

    /// Writes the current snapshot to the data file and resets the
    /// journal, all under the writer lock so the snapshot and the journal
    /// cut line up.
    fn checkpoint(&self) -> Result<()> {
        let Some(data_path) = &self.data_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap();

        let root = self.root.read().unwrap().clone();
        let revision = root.revision();
        let root_record = root.record_id();
        let count = self.nb_elems.load(Ordering::SeqCst);

        let transaction = self.transactions.begin(root, revision);
        let mut stack = Vec::new();
        transaction.root().browse_first(&mut stack);
        let cursor = Cursor::new(transaction, stack);

        checkpoint::write_snapshot(data_path, count, cursor, &*self.key_ser, &*self.value_ser)?;

        if let Some(journal) = &self.journal {
            journal.lock().unwrap().truncate()?;
        }
        debug!(
            "checkpoint complete: {} entries at revision {} (root record {})",
            count,
            revision,
            root_record
        );
        Ok(())
    }
}

impl<K, V> BTree<K, V> {
    fn stop_threads(&mut self) {
        debug!(
            "stopping background threads; {} read transactions registered",
            self.transactions.len()
        );
        if let Some(tx) = self.reaper_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reaper_thread.take() {
            let _ = handle.join();
        }
        if let Some(tx) = self.journal_tx.take() {
            let _ = tx.send(Modification::Poison);
        }
        if let Some(handle) = self.journal_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<K, V> BTree<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + PartialEq + 'static,
{
    /// Removes only a value equal to `value`. The key survives while
    /// other values remain under it; the removal is structural only when
    /// the last value goes.
    pub fn delete_value(&self, key: &K, value: &V) -> Result<Option<Tuple<K, V>>> {
        self.ensure_open()?;
        let filter: &dyn Fn(&V) -> bool = &|candidate| candidate == value;
        Ok(self.apply_delete(key, Some(filter), true))
    }
}

impl<K, V> Drop for BTree<K, V> {
    fn drop(&mut self) {
        // Stop the background threads but skip the checkpoint: the
        // journal keeps every record, so the next open replays them.
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.stop_threads();
    }
}

/// The configured path if a file already exists there, `⟨path⟩.data`
/// otherwise.
fn resolve_data_path(path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mavibot".to_string());
    path.with_file_name(format!("{}.data", name))
}

fn collect_stats<K, V>(page: &Arc<Page<K, V>>, stats: &mut TreeStats) -> usize {
    stats.page_count += 1;
    match page.children() {
        None => {
            stats.leaf_count += 1;
            0
        }
        Some(children) => {
            stats.node_count += 1;
            let mut depth = 0;
            for child in children {
                depth = collect_stats(child, stats);
            }
            depth + 1
        }
    }
}
