//! An embedded, in-process ordered key-value store.
//!
//! The store maps totally-ordered keys to values over a persistent
//! (copy-on-write) B+Tree with MVCC: readers traverse a stable snapshot
//! while a single writer publishes new roots. Durability comes from a
//! write-ahead journal drained by a background thread, retired whenever a
//! checkpoint atomically replaces the on-disk snapshot.
//!
//! ```no_run
//! use mavibot::{BTree, StoreConfig, LongSerializer, StringSerializer};
//! use std::sync::Arc;
//!
//! # fn main() -> mavibot::Result<()> {
//! let mut tree = BTree::open(
//!     StoreConfig::new("/tmp/example").page_size(16),
//!     Arc::new(LongSerializer),
//!     Arc::new(StringSerializer),
//! )?;
//!
//! tree.insert(1, "apple".to_string())?;
//! tree.insert(2, "pear".to_string())?;
//! for tuple in tree.browse()? {
//!     println!("{} -> {}", tuple.key, tuple.value);
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

mod btree;
mod buffer;
mod checkpoint;
mod cursor;
mod error;
mod journal;
mod page;
mod serializer;
mod transaction;

pub use btree::{BTree, StoreConfig, TreeStats, DEFAULT_PAGE_SIZE, DEFAULT_READ_TIMEOUT};
pub use buffer::BufferHandler;
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use journal::DEFAULT_JOURNAL_NAME;
pub use page::{Tuple, ValueHolder};
pub use serializer::{LongSerializer, Serializer, StringSerializer};
pub use transaction::ReadTransaction;
