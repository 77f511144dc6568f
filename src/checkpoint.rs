//! Checkpointing: atomic replacement of the on-disk snapshot.
//!
//! A checkpoint walks the current snapshot in key order and writes a flat
//! sorted dump: a big-endian u64 entry count followed by serialized
//! (key, value) pairs. The new file is fsynced under a unique temporary
//! name, then swapped in with a rename sequence that leaves either the old
//! or the new file intact if the process dies in between.

use crate::buffer::BufferHandler;
use crate::error::{Error, Result};
use crate::page::Tuple;
use crate::serializer::Serializer;
use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sequence for unique temp names within one process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A unique sibling of `path` carrying `suffix`.
fn temp_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let seq = TEMP_SEQ.fetch_add(1, Ordering::SeqCst);
    path.with_file_name(format!("{}.{}.{}.{}", name, std::process::id(), seq, suffix))
}

/// Writes `count` tuples to a temp file next to `data_path`, fsyncs it,
/// and swaps it into place: the current data file moves to a backup name,
/// the temp file takes its place, the backup is deleted.
pub(crate) fn write_snapshot<K, V>(
    data_path: &Path,
    count: u64,
    tuples: impl Iterator<Item = Tuple<K, V>>,
    key_ser: &dyn Serializer<K>,
    value_ser: &dyn Serializer<V>,
) -> Result<()> {
    let tmp = temp_path(data_path, "tmp");

    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    writer.write_u64::<BigEndian>(count)?;

    let mut buf = Vec::new();
    let mut written = 0u64;
    for tuple in tuples {
        buf.clear();
        key_ser.serialize(&tuple.key, &mut buf);
        value_ser.serialize(&tuple.value, &mut buf);
        writer.write_all(&buf)?;
        written += 1;
    }
    debug_assert_eq!(written, count);

    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    let backup = temp_path(data_path, "bak");
    let had_previous = data_path.exists();
    if had_previous {
        fs::rename(data_path, &backup)?;
    }
    fs::rename(&tmp, data_path)?;
    if had_previous {
        fs::remove_file(&backup)?;
    }

    debug!("snapshot written: {} entries at {}", written, data_path.display());
    Ok(())
}

/// Reads a snapshot back: the entry count, then that many pairs in
/// ascending key order, each fed to `apply`. The pairs are exactly as
/// many as the header promises; anything short of that is corruption.
pub(crate) fn load_snapshot<K, V>(
    path: &Path,
    key_ser: &dyn Serializer<K>,
    value_ser: &dyn Serializer<V>,
    mut apply: impl FnMut(K, V) -> Result<()>,
) -> Result<u64> {
    let file = File::open(path)?;
    let mut input = BufferHandler::new(file);

    let header = input.read(8).map_err(reject_eof)?;
    let array: [u8; 8] = header
        .as_slice()
        .try_into()
        .map_err(|_| Error::Corruption("truncated snapshot header".to_string()))?;
    let count = u64::from_be_bytes(array);

    for _ in 0..count {
        let key = key_ser.deserialize(&mut input).map_err(reject_eof)?;
        let value = value_ser.deserialize(&mut input).map_err(reject_eof)?;
        apply(key, value)?;
    }

    Ok(count)
}

fn reject_eof(e: Error) -> Error {
    match e {
        Error::EndOfInput => Error::Corruption("snapshot truncated".to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{LongSerializer, StringSerializer};

    fn tuples(pairs: &[(i64, &str)]) -> Vec<Tuple<i64, String>> {
        pairs
            .iter()
            .map(|(k, v)| Tuple::new(*k, v.to_string()))
            .collect()
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");

        let entries = tuples(&[(1, "a"), (2, "b"), (3, "c")]);
        write_snapshot(
            &path,
            3,
            entries.clone().into_iter(),
            &LongSerializer,
            &StringSerializer,
        )
        .unwrap();

        let mut loaded = Vec::new();
        let count = load_snapshot(&path, &LongSerializer, &StringSerializer, |k, v| {
            loaded.push(Tuple::new(k, v));
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_snapshot_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");

        write_snapshot(
            &path,
            1,
            tuples(&[(1, "old")]).into_iter(),
            &LongSerializer,
            &StringSerializer,
        )
        .unwrap();
        write_snapshot(
            &path,
            2,
            tuples(&[(1, "new"), (2, "b")]).into_iter(),
            &LongSerializer,
            &StringSerializer,
        )
        .unwrap();

        let mut loaded = Vec::new();
        load_snapshot(&path, &LongSerializer, &StringSerializer, |k, v| {
            loaded.push((k, v));
            Ok(())
        })
        .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], (1, "new".to_string()));

        // No temp or backup files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "store.data")
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }

    #[test]
    fn test_truncated_snapshot_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");

        write_snapshot(
            &path,
            2,
            tuples(&[(1, "a"), (2, "b")]).into_iter(),
            &LongSerializer,
            &StringSerializer,
        )
        .unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let result = load_snapshot(&path, &LongSerializer, &StringSerializer, |_, _| Ok(()));
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");

        write_snapshot(
            &path,
            0,
            Vec::<Tuple<i64, String>>::new().into_iter(),
            &LongSerializer,
            &StringSerializer,
        )
        .unwrap();

        let count = load_snapshot(&path, &LongSerializer, &StringSerializer, |_, _| {
            panic!("no entries expected")
        })
        .unwrap();
        assert_eq!(count, 0);
    }
}
