//! Write-ahead journal: the durable log of logical modifications.
//!
//! Every successful mutation enqueues one record; a background writer
//! drains the queue, appends `tag + key (+ value)` to the journal file and
//! forces it to disk. On open, a non-empty journal is replayed on top of
//! the last checkpoint, which is how mutations survive a crash between
//! checkpoints.

use crate::buffer::BufferHandler;
use crate::error::{Error, Result};
use crate::serializer::Serializer;
use log::{debug, error};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Journal file name used when none can be derived from the data file.
pub const DEFAULT_JOURNAL_NAME: &str = "mavibot.log";

/// Record tag: an insertion, followed by serialized key and value.
const TAG_ADDITION: u8 = 0x00;
/// Record tag: a deletion, followed by the serialized key.
const TAG_DELETION: u8 = 0x01;
/// Reserved for the shutdown sentinel; never valid on disk.
const TAG_POISON: u8 = 0x02;

/// One logical modification, as enqueued for the journal writer.
pub(crate) enum Modification<K, V> {
    Addition(K, V),
    Deletion(K),
    /// Shutdown sentinel: the writer drains the queue and exits.
    Poison,
}

/// The journal file sibling to `data_path`: same name with a `.log`
/// extension, or [`DEFAULT_JOURNAL_NAME`] when the path has no usable
/// file name.
pub(crate) fn journal_path(data_path: &Path) -> PathBuf {
    match data_path.file_stem() {
        Some(stem) => data_path.with_file_name(format!("{}.log", stem.to_string_lossy())),
        None => data_path.with_file_name(DEFAULT_JOURNAL_NAME),
    }
}

/// Append handle over the journal file.
pub(crate) struct Journal {
    file: File,
}

impl Journal {
    /// Opens (or creates) the journal at `path` for appending.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Journal { file })
    }

    /// Appends one record and forces it to disk.
    pub(crate) fn append<K, V>(
        &mut self,
        modification: &Modification<K, V>,
        key_ser: &dyn Serializer<K>,
        value_ser: &dyn Serializer<V>,
    ) -> Result<()> {
        let mut record = Vec::new();
        match modification {
            Modification::Addition(key, value) => {
                record.push(TAG_ADDITION);
                key_ser.serialize(key, &mut record);
                value_ser.serialize(value, &mut record);
            }
            Modification::Deletion(key) => {
                record.push(TAG_DELETION);
                key_ser.serialize(key, &mut record);
            }
            Modification::Poison => return Ok(()),
        }
        self.file.write_all(&record)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Resets the journal to length zero; mutations start accumulating a
    /// fresh log.
    pub(crate) fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Whether the journal at `path` holds any records.
pub(crate) fn has_records(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Replays the journal in record order, feeding each modification to
/// `apply`. A clean end-of-file terminates the replay; a record that can
/// only be partially read is corruption.
pub(crate) fn replay<K, V>(
    path: &Path,
    key_ser: &dyn Serializer<K>,
    value_ser: &dyn Serializer<V>,
    mut apply: impl FnMut(Modification<K, V>) -> Result<()>,
) -> Result<usize> {
    let file = File::open(path)?;
    let mut input = BufferHandler::new(file);
    let mut count = 0usize;

    loop {
        let tag = match input.read_byte() {
            Ok(tag) => tag,
            Err(Error::EndOfInput) => break,
            Err(e) => return Err(e),
        };
        let modification = match tag {
            TAG_ADDITION => {
                let key = key_ser.deserialize(&mut input).map_err(reject_eof)?;
                let value = value_ser.deserialize(&mut input).map_err(reject_eof)?;
                Modification::Addition(key, value)
            }
            TAG_DELETION => Modification::Deletion(key_ser.deserialize(&mut input).map_err(reject_eof)?),
            TAG_POISON => {
                return Err(Error::Corruption(
                    "shutdown sentinel found in journal".to_string(),
                ))
            }
            other => {
                return Err(Error::Corruption(format!(
                    "unknown journal tag {:#04x}",
                    other
                )))
            }
        };
        apply(modification)?;
        count += 1;
    }

    Ok(count)
}

/// End-of-input in the middle of a record is a short read, not a clean
/// boundary.
fn reject_eof(e: Error) -> Error {
    match e {
        Error::EndOfInput => Error::Corruption("journal record truncated".to_string()),
        other => other,
    }
}

/// Starts the journal writer thread. Records are written and fsynced one
/// at a time, in enqueue order. A write failure is logged and the writer
/// keeps accepting records: durability is re-established at the next
/// checkpoint. The poison sentinel (or the senders all dropping) drains
/// whatever is still queued and stops the thread.
pub(crate) fn spawn_writer<K, V>(
    receiver: Receiver<Modification<K, V>>,
    mut journal: Journal,
    key_ser: Arc<dyn Serializer<K>>,
    value_ser: Arc<dyn Serializer<V>>,
) -> JoinHandle<()>
where
    K: Send + 'static,
    V: Send + 'static,
{
    thread::Builder::new()
        .name("journal".to_string())
        .spawn(move || {
            let mut write = |modification: &Modification<K, V>| {
                if let Err(e) = journal.append(modification, &*key_ser, &*value_ser) {
                    error!("journal write failed: {}", e);
                }
            };
            loop {
                match receiver.recv() {
                    Ok(Modification::Poison) | Err(_) => {
                        // Orderly drain of anything still enqueued.
                        while let Ok(modification) = receiver.try_recv() {
                            write(&modification);
                        }
                        debug!("journal writer stopped");
                        return;
                    }
                    Ok(modification) => write(&modification),
                }
            }
        })
        .expect("failed to spawn journal thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{LongSerializer, StringSerializer};
    use std::sync::mpsc;

    fn collect(path: &Path) -> Result<Vec<(u8, i64, Option<String>)>> {
        let mut out = Vec::new();
        replay(path, &LongSerializer, &StringSerializer, |m| {
            match m {
                Modification::Addition(k, v) => out.push((TAG_ADDITION, k, Some(v))),
                Modification::Deletion(k) => out.push((TAG_DELETION, k, None)),
                Modification::Poison => unreachable!("poison is never replayed"),
            }
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(
                &Modification::Addition(1, "one".to_string()),
                &LongSerializer,
                &StringSerializer,
            )
            .unwrap();
        journal
            .append(
                &Modification::<i64, String>::Deletion(2),
                &LongSerializer,
                &StringSerializer,
            )
            .unwrap();

        let records = collect(&path).unwrap();
        assert_eq!(
            records,
            vec![
                (TAG_ADDITION, 1, Some("one".to_string())),
                (TAG_DELETION, 2, None),
            ]
        );
    }

    #[test]
    fn test_truncate_retires_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(
                &Modification::Addition(1, "one".to_string()),
                &LongSerializer,
                &StringSerializer,
            )
            .unwrap();
        assert!(has_records(&path));

        journal.truncate().unwrap();
        assert!(!has_records(&path));
        assert_eq!(collect(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_torn_record_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(
                &Modification::Addition(1, "one".to_string()),
                &LongSerializer,
                &StringSerializer,
            )
            .unwrap();

        // Chop the tail off the only record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        assert!(matches!(collect(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, [0x7f]).unwrap();
        assert!(matches!(collect(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_writer_thread_drains_on_poison() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        let journal = Journal::open(&path).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = spawn_writer(
            rx,
            journal,
            Arc::new(LongSerializer) as Arc<dyn Serializer<i64>>,
            Arc::new(StringSerializer) as Arc<dyn Serializer<String>>,
        );

        for i in 0..10 {
            tx.send(Modification::Addition(i, format!("v{}", i))).unwrap();
        }
        tx.send(Modification::Poison).unwrap();
        handle.join().unwrap();

        let records = collect(&path).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[9].1, 9);
    }

    #[test]
    fn test_journal_path_derivation() {
        assert_eq!(
            journal_path(Path::new("/tmp/store.data")),
            PathBuf::from("/tmp/store.log")
        );
        assert_eq!(
            journal_path(Path::new("/tmp/store")),
            PathBuf::from("/tmp/store.log")
        );
    }
}
