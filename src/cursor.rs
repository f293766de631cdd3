//! # Read Cursor
//!
//! A [`Cursor`] walks a table in key order without disturbing it. The
//! cursor borrows the table, so within one handle the tree cannot shift
//! underneath it; across handles the usual revision checks apply and a
//! discarded snapshot surfaces as a `Modified` error.
//!
//! ## Position Vector
//!
//! Like the table's built-in cursor, a read cursor keeps one
//! [`CursorLevel`] per B-tree level: an owned block buffer, the directory
//! offset `c`, the block number, and (always false here) the rewrite flag.
//! The root level is copied from the table at creation; lower levels load
//! on demand as the cursor descends.
//!
//! ## Traversal
//!
//! `next`/`prev` step between logical entries: continuation items of a
//! chunked tag (component counter above 1) are skipped, and the sentinel
//! null item of the leftmost leaf is treated as "before the first entry".
//! When the table is in sequential mode the leaf level advances by block
//! number instead of re-descending, skipping blocks the writer's built-in
//! cursor holds in modified form.
//!
//! ## Tags
//!
//! [`Cursor::read_tag`] reassembles and inflates the tag at the current
//! position, leaving the cursor on the final component, so the next `next()`
//! proceeds to the following key, so scan-and-read loops cost nothing
//! extra.

use eyre::Result;

use crate::block::{self, D2, DIR_START};
use crate::compress::CompressionContext;
use crate::error::TableError;
use crate::item::{self, C2, I2, K1, MAX_KEY_LEN};
use crate::table::Table;

/// One level of a cursor: an owned block buffer and a position in it.
#[derive(Debug)]
pub(crate) struct CursorLevel {
    pub buf: Vec<u8>,
    /// Directory byte offset, -1 when unset.
    pub c: i32,
    pub n: Option<u32>,
    pub rewrite: bool,
}

impl CursorLevel {
    pub fn new(block_size: usize) -> Self {
        Self {
            buf: vec![0; block_size],
            c: -1,
            n: None,
            rewrite: false,
        }
    }
}

/// A read-only, bidirectional cursor over a table.
pub struct Cursor<'t> {
    table: &'t Table,
    c: Vec<CursorLevel>,
    positioned: bool,
    current_key: Vec<u8>,
    decompressor: CompressionContext,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(table: &'t Table) -> Self {
        let mut c: Vec<CursorLevel> = (0..=table.level)
            .map(|_| CursorLevel::new(table.block_size))
            .collect();
        let root = table.level;
        c[root].buf.copy_from_slice(&table.c[root].buf);
        c[root].n = table.c[root].n;
        Self {
            table,
            c,
            positioned: false,
            current_key: Vec::new(),
            decompressor: CompressionContext::new(),
        }
    }

    /// Positions at the greatest entry whose key is at most `key`,
    /// returning whether the match was exact. With no entry at or below
    /// `key` the cursor parks before the first entry (`key()` is empty)
    /// and `next()` yields the first one.
    pub fn find_entry(&mut self, key: &[u8]) -> Result<bool> {
        let search = item::search_key(&key[..key.len().min(MAX_KEY_LEN)]);
        let mut found = self.table.find_read(&mut self.c, search.as_key())?;
        if key.len() > MAX_KEY_LEN {
            // Too long to possibly be present; the truncated search still
            // positions us usefully.
            found = false;
        }
        self.positioned = true;

        if !found {
            if self.c[0].c < DIR_START {
                self.c[0].c = DIR_START;
                // The leaf's first key can still exceed the target when the
                // parent separator was a truncated form; the true
                // predecessor then sits in an earlier leaf.
                if block::item_at(&self.c[0].buf, DIR_START).key() > search.as_key()
                    && !self.prev_leaf()?
                {
                    self.positioned = false;
                }
            }
            while self.positioned
                && block::item_at(&self.c[0].buf, self.c[0].c).component_of() != 1
            {
                if !self.prev_leaf()? {
                    self.positioned = false;
                }
            }
        }

        self.update_current_key();
        Ok(found)
    }

    /// Advances to the next entry, skipping tag continuations.
    pub fn next(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        loop {
            if !self.next_leaf()? {
                self.positioned = false;
                break;
            }
            if block::item_at(&self.c[0].buf, self.c[0].c).component_of() == 1 {
                break;
            }
        }
        self.update_current_key();
        Ok(self.positioned)
    }

    /// Steps back to the previous entry. Reaching the leftmost sentinel
    /// counts as running off the front.
    pub fn prev(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        loop {
            if !self.prev_leaf()? {
                self.positioned = false;
                break;
            }
            let item = block::item_at(&self.c[0].buf, self.c[0].c);
            if item.component_of() == 1 {
                if item.key().is_empty() {
                    self.positioned = false;
                }
                break;
            }
        }
        self.update_current_key();
        Ok(self.positioned)
    }

    /// The key body at the current position; empty when unpositioned or
    /// parked before the first entry.
    pub fn key(&self) -> &[u8] {
        &self.current_key
    }

    /// Reassembles the tag at the current position into `out`, inflating
    /// compressed storage. The cursor is left on the tag's last component.
    pub fn read_tag(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.do_read_tag(out, false)?;
        Ok(())
    }

    /// Like [`read_tag`](Self::read_tag) but hands back the stored bytes
    /// untouched, returning whether they are deflate-compressed; for
    /// tooling that copies entries between tables without recompressing.
    pub fn read_raw_tag(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        self.do_read_tag(out, true)
    }

    fn do_read_tag(&mut self, out: &mut Vec<u8>, keep_compressed: bool) -> Result<bool> {
        if !self.positioned {
            return Err(TableError::storage("cursor is not positioned on an entry"));
        }
        out.clear();
        let (n, compressed) = {
            let item = block::item_at(&self.c[0].buf, self.c[0].c);
            (item.components_of(), item.compressed())
        };
        if n > 1 {
            out.reserve((self.table.max_item_size - (1 + K1 + I2 + 2 * C2)) * n as usize);
        }
        block::item_at(&self.c[0].buf, self.c[0].c).append_chunk(out);

        for i in 2..=n {
            if !self.next_leaf()? {
                return Err(TableError::corrupt(
                    "unexpected end of table when reading continuation of tag",
                ));
            }
            let item = block::item_at(&self.c[0].buf, self.c[0].c);
            if item.component_of() != i {
                return Err(TableError::corrupt("tag continuation item is missing"));
            }
            item.append_chunk(out);
        }

        if !compressed || keep_compressed {
            return Ok(compressed);
        }
        let packed = std::mem::take(out);
        self.decompressor.decompress(&packed, out)?;
        Ok(false)
    }

    fn update_current_key(&mut self) {
        self.current_key.clear();
        if self.positioned {
            self.current_key
                .extend_from_slice(block::item_at(&self.c[0].buf, self.c[0].c).key().body());
        }
    }

    // ---------------- item-level stepping ----------------

    fn next_leaf(&mut self) -> Result<bool> {
        if self.table.sequential {
            return self.next_sequential();
        }
        self.next_default(0)
    }

    fn prev_leaf(&mut self) -> Result<bool> {
        if self.table.sequential {
            return self.prev_sequential();
        }
        self.prev_default(0)
    }

    fn next_default(&mut self, j: usize) -> Result<bool> {
        let mut c = self.c[j].c + D2;
        if c >= block::dir_end(&self.c[j].buf) {
            if j == self.table.level {
                return Ok(false);
            }
            if !self.next_default(j + 1)? {
                return Ok(false);
            }
            c = DIR_START;
        }
        self.c[j].c = c;
        if j > 0 {
            let child = block::item_at(&self.c[j].buf, c).block_given_by();
            self.table.block_to_cursor_read(&mut self.c, j - 1, child)?;
        }
        Ok(true)
    }

    fn prev_default(&mut self, j: usize) -> Result<bool> {
        let mut c = self.c[j].c;
        if c == DIR_START {
            if j == self.table.level {
                return Ok(false);
            }
            if !self.prev_default(j + 1)? {
                return Ok(false);
            }
            c = block::dir_end(&self.c[j].buf);
        }
        c -= D2;
        self.c[j].c = c;
        if j > 0 {
            let child = block::item_at(&self.c[j].buf, c).block_given_by();
            self.table.block_to_cursor_read(&mut self.c, j - 1, child)?;
        }
        Ok(true)
    }

    /// Sequential fast path: the next leaf is found by walking block
    /// numbers upward. Blocks sitting modified in the writer's built-in
    /// cursor are not valid on disk yet: the leaf is taken from memory,
    /// internal levels are skipped outright.
    fn next_sequential(&mut self) -> Result<bool> {
        let t = self.table;
        let mut c = self.c[0].c + D2;
        if c == block::dir_end(&self.c[0].buf) {
            let mut n = self.c[0]
                .n
                .ok_or_else(|| TableError::corrupt("sequential scan from an unloaded leaf"))?;
            loop {
                n = match n.checked_add(1) {
                    Some(n) => n,
                    None => return Ok(false),
                };
                if n > t.base_last_block() {
                    return Ok(false);
                }
                if !self.load_sequential(n)? {
                    continue;
                }
                if block::revision(&self.c[0].buf) > t.revision + u32::from(t.writable) {
                    return Err(t.set_overwritten());
                }
                if block::level(&self.c[0].buf) == 0 {
                    break;
                }
            }
            self.c[0].n = Some(n);
            c = DIR_START;
        }
        self.c[0].c = c;
        Ok(true)
    }

    fn prev_sequential(&mut self) -> Result<bool> {
        let t = self.table;
        let mut c = self.c[0].c;
        if c == DIR_START {
            let mut n = self.c[0]
                .n
                .ok_or_else(|| TableError::corrupt("sequential scan from an unloaded leaf"))?;
            loop {
                if n == 0 {
                    return Ok(false);
                }
                n -= 1;
                if !self.load_sequential(n)? {
                    continue;
                }
                if block::revision(&self.c[0].buf) > t.revision + u32::from(t.writable) {
                    return Err(t.set_overwritten());
                }
                if block::level(&self.c[0].buf) == 0 {
                    break;
                }
            }
            self.c[0].n = Some(n);
            c = block::dir_end(&self.c[0].buf);
        }
        c -= D2;
        self.c[0].c = c;
        Ok(true)
    }

    /// Loads block `n` into the leaf level, honoring the writer's
    /// in-memory state. Returns false when the block must be skipped.
    fn load_sequential(&mut self, n: u32) -> Result<bool> {
        let t = self.table;
        if t.writable {
            if t.c[0].n == Some(n) {
                self.c[0].buf.copy_from_slice(&t.c[0].buf);
                return Ok(true);
            }
            if (1..=t.level).any(|j| t.c[j].n == Some(n)) {
                return Ok(false);
            }
        }
        t.read_block(n, &mut self.c[0].buf)?;
        Ok(true)
    }
}
