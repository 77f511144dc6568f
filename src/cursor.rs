//! Ordered iteration over one snapshot of the tree.
//!
//! A cursor owns a read transaction and a stack of [`ParentPos`] frames:
//! the path from the pinned root down to the current leaf position. All
//! pages on the path are immutable, so traversal takes no locks; the
//! cursor is single-threaded and not meant to be shared.

use crate::page::{Page, Tuple};
use crate::transaction::ReadTransaction;
use std::sync::Arc;

/// One frame of the cursor path: a page and the position within it. On a
/// leaf the position indexes the current entry; on a node it indexes the
/// child currently descended into.
pub(crate) struct ParentPos<K, V> {
    pub(crate) page: Arc<Page<K, V>>,
    pub(crate) pos: usize,
}

impl<K, V> ParentPos<K, V> {
    pub(crate) fn new(page: Arc<Page<K, V>>, pos: usize) -> Self {
        ParentPos { page, pos }
    }
}

/// Stateful ascending iterator over the snapshot pinned by its
/// transaction. Closing (or dropping) the cursor closes the transaction.
pub struct Cursor<K, V> {
    transaction: Arc<ReadTransaction<K, V>>,
    stack: Vec<ParentPos<K, V>>,
    /// Position within the current entry's value holder.
    value_pos: usize,
}

impl<K: Clone, V: Clone> Cursor<K, V> {
    pub(crate) fn new(
        transaction: Arc<ReadTransaction<K, V>>,
        stack: Vec<ParentPos<K, V>>,
    ) -> Self {
        Cursor {
            transaction,
            stack,
            value_pos: 0,
        }
    }

    /// Revision of the snapshot this cursor traverses.
    pub fn revision(&self) -> u64 {
        self.transaction.revision()
    }

    /// Whether another tuple exists in ascending key order.
    pub fn has_next(&self) -> bool {
        let Some(top) = self.stack.last() else {
            return false;
        };
        if top.pos < top.page.nb_elems() {
            return true;
        }
        // Current leaf exhausted: any ancestor with an unvisited right
        // sibling still has tuples.
        self.stack[..self.stack.len() - 1]
            .iter()
            .any(|frame| frame.pos < frame.page.nb_elems())
    }

    /// Returns the next tuple, or `None` when the snapshot is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Tuple<K, V>> {
        loop {
            let top = self.stack.last_mut()?;
            if top.pos < top.page.nb_elems() {
                if let Some(leaf) = top.page.as_leaf() {
                    let holder = leaf.value_at(top.pos);
                    let tuple = Tuple::new(
                        leaf.key_at(top.pos).clone(),
                        holder.get(self.value_pos).clone(),
                    );
                    self.value_pos += 1;
                    if self.value_pos == holder.len() {
                        self.value_pos = 0;
                        top.pos += 1;
                    }
                    return Some(tuple);
                }
            }
            if !self.climb() {
                return None;
            }
        }
    }

    /// Pops frames until an ancestor has an unvisited right sibling, then
    /// descends to that sibling's leftmost leaf. Returns false when the
    /// whole snapshot is behind the cursor.
    fn climb(&mut self) -> bool {
        self.stack.pop();
        while let Some(frame) = self.stack.last_mut() {
            if frame.pos < frame.page.nb_elems() {
                frame.pos += 1;
                let child = frame.page.children().expect("cursor frame above a leaf")
                    [frame.pos]
                    .clone();
                child.browse_first(&mut self.stack);
                return true;
            }
            self.stack.pop();
        }
        false
    }

    /// Closes the cursor and its transaction.
    pub fn close(self) {
        // Drop does the work.
    }
}

impl<K, V> Drop for Cursor<K, V> {
    fn drop(&mut self) {
        self.transaction.close();
    }
}

impl<K: Clone, V: Clone> Iterator for Cursor<K, V> {
    type Item = Tuple<K, V>;

    fn next(&mut self) -> Option<Tuple<K, V>> {
        Cursor::next(self)
    }
}
