//! # Table
//!
//! This module implements the revisioned B-tree table: a map from
//! variable-length byte keys to variable-length byte tags, persisted in a
//! block file (`<name>DB`) and anchored by a pair of base files
//! (`<name>baseA` / `<name>baseB`).
//!
//! ## Copy-on-Write Revisions
//!
//! Every commit produces a new revision. Blocks reachable from an older
//! committed revision are never written in place: before a block on the
//! cursor path is modified, `alter` walks leaf-to-root giving each block
//! that was live at transaction start a fresh number and repointing its
//! parent. Concurrent readers that opened the previous revision keep a
//! fully consistent tree; a reader that races a later commit far enough to
//! lose its snapshot gets a `Modified` error and must reopen.
//!
//! ## Commit Protocol
//!
//! ```text
//! 1. write all dirty cursor blocks
//! 2. fsync the data file            <- durability boundary
//! 3. serialize the base to <name>tmp (fsynced)
//! 4. rename over base<letter>, letters alternating per commit
//! ```
//!
//! A crash before step 4 leaves the previous base authoritative and the new
//! blocks unreferenced; a crash after is the new revision. The first block
//! write of a transaction deletes the stale alternate base so a torn commit
//! can never resurrect it.
//!
//! ## Sequential Mode
//!
//! A run of adjacent insertions (counted down from [`SEQ_START_POINT`])
//! flips splitting from the byte-weighted midpoint to the insertion point,
//! so ascending bulk loads fill blocks edge to edge, and enables cursor
//! fast paths that walk leaf blocks by number instead of re-descending.
//!
//! ## Long Tags
//!
//! A tag longer than one item is stored as m components with identical key
//! body and counters 1..=m; tags above [`COMPRESS_MIN`] bytes are raw
//! deflate compressed first when that actually shrinks them. The first
//! chunk may be shortened to exactly fill the target leaf's residual free
//! space.

use std::fs::File;
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};

use eyre::Result;
use tracing::{debug, trace};

use crate::base::{Base, CHANGES_BLOCKS};
use crate::block::{
    self, BTREE_CURSOR_LEVELS, D2, DEFAULT_BLOCK_SIZE, DIR_START, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use crate::compress::{CompressStrategy, CompressionContext, COMPRESS_MIN};
use crate::cursor::{Cursor, CursorLevel};
use crate::encoding::pack_uint;
use crate::error::TableError;
use crate::io;
use crate::item::{self, Item, ItemBuf, Key, C2, I2, K1, MAX_COMPONENTS, MAX_KEY_LEN};

/// Flip to sequential-addition block splitting after this many observed
/// adjacent insertions (counted up from the negated value).
pub const SEQ_START_POINT: i32 = -10;

/// Residue threshold for the first-chunk fill under full compaction;
/// empirically, packing tighter than `key_len + 34` costs more in longer
/// dividing keys than it saves.
pub const FULL_COMPACTION_SLACK: usize = 34;

/// A block must hold at least this many maximum-sized items.
const BLOCK_CAPACITY: usize = 4;

/// A persistent, revisioned B-tree table.
///
/// One writer and any number of read-only handles may be attached to the
/// same files; each handle is single-threaded. Read handles snapshot the
/// revision current at open time.
#[derive(Debug)]
pub struct Table {
    dir: PathBuf,
    tablename: String,
    pub(crate) writable: bool,
    compress_strategy: CompressStrategy,
    full_compaction: bool,
    dangerous: bool,

    file: Option<File>,
    closed: bool,

    base: Base,
    base_letter: char,
    both_bases: bool,
    pub(crate) revision: u32,
    latest_revision: u32,
    pub(crate) block_size: usize,
    root: u32,
    pub(crate) level: usize,
    item_count: u32,
    faked_root_block: bool,
    pub(crate) sequential: bool,

    pub(crate) c: Vec<CursorLevel>,
    kt: ItemBuf,
    split_buf: Vec<u8>,
    scratch: Vec<u8>,
    pub(crate) max_item_size: usize,
    modified: bool,
    seq_count: i32,
    changed_n: Option<u32>,
    changed_c: i32,
    compressor: CompressionContext,
}

impl Table {
    /// Creates an unopened handle for table `tablename` in `dir`. Follow
    /// with [`open`](Self::open), [`open_at`](Self::open_at) or
    /// [`create_and_open`](Self::create_and_open).
    pub fn new(dir: impl AsRef<Path>, tablename: &str, readonly: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            tablename: tablename.to_string(),
            writable: !readonly,
            compress_strategy: CompressStrategy::default(),
            full_compaction: false,
            dangerous: false,
            file: None,
            closed: false,
            base: Base::new(),
            base_letter: 'A',
            both_bases: false,
            revision: 0,
            latest_revision: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            root: 0,
            level: 0,
            item_count: 0,
            faked_root_block: true,
            sequential: true,
            c: Vec::new(),
            kt: ItemBuf::default(),
            split_buf: Vec::new(),
            scratch: Vec::new(),
            max_item_size: 0,
            modified: false,
            seq_count: 0,
            changed_n: Some(0),
            changed_c: DIR_START,
            compressor: CompressionContext::new(),
        }
    }

    fn file_path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.tablename, suffix))
    }

    fn base_path(&self, letter: char) -> PathBuf {
        self.file_path(&format!("base{letter}"))
    }

    fn other_letter(&self) -> char {
        if self.base_letter == 'A' {
            'B'
        } else {
            'A'
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(TableError::Closed.into());
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(TableError::storage("table handle is read-only"));
        }
        Ok(())
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn tree_level(&self) -> usize {
        self.level
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Sets the block size used by the next
    /// [`create_and_open`](Self::create_and_open). Out-of-range or
    /// non-power-of-two values fall back to the default.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            && block_size.is_power_of_two()
        {
            block_size
        } else {
            DEFAULT_BLOCK_SIZE
        };
    }

    /// Full compaction packs blocks more tightly at the cost of extra CPU,
    /// and treats insertions as sequential from the start.
    pub fn set_full_compaction(&mut self, parity: bool) {
        if parity {
            self.seq_count = 0;
        }
        self.full_compaction = parity;
    }

    pub fn set_compress_strategy(&mut self, strategy: CompressStrategy) {
        self.compress_strategy = strategy;
    }

    /// Dangerous mode writes modified blocks back in place, skipping the
    /// copy-on-write climb. Faster for a full rebuild, but the table cannot
    /// be searched while it is being written and an unclean stop corrupts
    /// it. The flag is recorded in the base file and read-only opens refuse
    /// a table last written this way.
    pub fn set_dangerous_mode(&mut self, enabled: bool) {
        self.dangerous = enabled;
    }

    // ---------------- opening and closing ----------------

    /// True iff the data file and at least one base file are present.
    pub fn exists(&self) -> bool {
        self.file_path("DB").exists()
            && (self.base_path('A').exists() || self.base_path('B').exists())
    }

    /// Removes the data file and both base files.
    pub fn erase(&mut self) {
        debug!(table = %self.tablename, "erase");
        self.close(false);
        io::unlink_tolerant(&self.base_path('A'));
        io::unlink_tolerant(&self.base_path('B'));
        io::unlink_tolerant(&self.file_path("DB"));
    }

    /// Releases the file handle and per-level buffers. With
    /// `permanent = true` the handle is latched: every further operation
    /// fails with [`TableError::Closed`].
    pub fn close(&mut self, permanent: bool) {
        self.file = None;
        if permanent {
            self.closed = true;
            return;
        }
        self.c.clear();
        self.split_buf = Vec::new();
        self.scratch = Vec::new();
        self.kt = ItemBuf::default();
    }

    /// Attaches to the newest committed revision.
    pub fn open(&mut self) -> Result<()> {
        debug!(table = %self.tablename, writable = self.writable, "open");
        self.check_open()?;
        self.close(false);
        if self.writable {
            self.do_open_to_write(None, false)?;
        } else {
            self.do_open_to_read(None)?;
        }
        Ok(())
    }

    /// Attaches to a specific historical revision. Returns `Ok(false)`
    /// without error when that revision is no longer (or not yet)
    /// available.
    pub fn open_at(&mut self, revision: u32) -> Result<bool> {
        debug!(table = %self.tablename, revision, "open at revision");
        self.check_open()?;
        self.close(false);
        let ok = if self.writable {
            self.do_open_to_write(Some(revision), false)?
        } else {
            self.do_open_to_read(Some(revision))?
        };
        if !ok {
            self.close(false);
        }
        Ok(ok)
    }

    /// Initializes a fresh table with the given block size and opens it for
    /// writing. Any existing table files are superseded.
    pub fn create_and_open(&mut self, block_size: usize) -> Result<()> {
        debug!(table = %self.tablename, block_size, "create");
        self.check_writable()?;
        self.close(false);
        self.set_block_size(block_size);

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| TableError::opening(format!("couldn't create '{}': {e}", self.dir.display())))?;

        let mut base = Base::new();
        base.set_revision(self.revision);
        base.set_block_size(self.block_size as u32);
        base.set_have_fakeroot(true);
        base.set_sequential(true);
        base.set_dangerous(self.dangerous);
        base.write_to_file(&self.base_path('A'), 'A', &self.tablename, None)?;
        io::unlink_tolerant(&self.base_path('B'));

        self.do_open_to_write(None, true)?;
        Ok(())
    }

    /// Reads both base files and adopts the requested (or newest) one.
    fn basic_open(&mut self, requested: Option<u32>) -> Result<bool> {
        let mut bases: Vec<(char, Base)> = Vec::new();
        let mut errors = String::new();
        for letter in ['A', 'B'] {
            let path = self.base_path(letter);
            if !path.exists() {
                continue;
            }
            match Base::read(&path) {
                Ok(base) => bases.push((letter, base)),
                Err(e) => {
                    errors.push_str(&format!("{e:#}; "));
                }
            }
        }
        self.both_bases = bases.len() == 2;

        if bases.is_empty() {
            if errors.is_empty() {
                errors.push_str("no base file found");
            }
            return Err(TableError::opening(format!(
                "error opening table '{}': {errors}",
                self.tablename
            )));
        }

        let chosen = match requested {
            Some(rev) => match bases.iter().position(|(_, b)| b.revision() == rev) {
                Some(i) => i,
                None => return Ok(false),
            },
            None => {
                let mut best = 0;
                for (i, (_, b)) in bases.iter().enumerate() {
                    if b.revision() >= bases[best].1.revision() {
                        best = i;
                    }
                }
                best
            }
        };

        let (letter, base) = bases.swap_remove(chosen);
        let other_revision = bases.first().map(|(_, b)| b.revision());

        self.revision = base.revision();
        self.block_size = base.block_size() as usize;
        self.root = base.root();
        self.level = base.level();
        self.item_count = base.item_count();
        self.faked_root_block = base.have_fakeroot();
        self.sequential = base.sequential();
        self.latest_revision = other_revision.map_or(self.revision, |r| r.max(self.revision));
        self.base = base;
        self.base_letter = letter;

        self.kt = ItemBuf::with_capacity(self.block_size);
        self.max_item_size =
            (self.block_size - DIR_START as usize - BLOCK_CAPACITY * D2 as usize) / BLOCK_CAPACITY;
        Ok(true)
    }

    fn do_open_to_read(&mut self, requested: Option<u32>) -> Result<bool> {
        let path = self.file_path("DB");
        let file = File::open(&path).map_err(|e| {
            TableError::opening(format!("couldn't open {} to read: {e}", path.display()))
        })?;
        self.file = Some(file);

        match self.basic_open(requested) {
            Ok(true) => {}
            Ok(false) => {
                self.file = None;
                return Ok(false);
            }
            Err(e) => {
                self.file = None;
                return Err(e);
            }
        }

        if self.base.dangerous() {
            self.file = None;
            return Err(TableError::opening(
                "table was last written in dangerous mode; refusing read-only open",
            ));
        }

        self.c = (0..=self.level)
            .map(|_| CursorLevel::new(self.block_size))
            .collect();
        self.read_root()?;
        Ok(true)
    }

    fn do_open_to_write(&mut self, requested: Option<u32>, create: bool) -> Result<bool> {
        let path = self.file_path("DB");
        let file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .open(&path)
            .map_err(|e| {
                let verb = if create { "create" } else { "open" };
                TableError::opening(format!(
                    "couldn't {verb} {} read/write: {e}",
                    path.display()
                ))
            })?;
        self.file = Some(file);

        match self.basic_open(requested) {
            Ok(true) => {}
            Ok(false) => {
                self.file = None;
                return Ok(false);
            }
            Err(e) => {
                self.file = None;
                return Err(e);
            }
        }

        self.c = (0..=self.level)
            .map(|_| CursorLevel::new(self.block_size))
            .collect();
        self.split_buf = vec![0; self.block_size];
        self.scratch = vec![0; self.block_size];
        self.read_root()?;

        self.changed_n = Some(0);
        self.changed_c = DIR_START;
        self.seq_count = SEQ_START_POINT;
        Ok(true)
    }

    /// Loads (or fakes) the root block into the top cursor level.
    fn read_root(&mut self) -> Result<()> {
        if self.faked_root_block {
            // Synthesize the root of an empty table: one null item with an
            // empty tag. Zeroing first keeps identical operation sequences
            // producing identical files.
            let block_size = self.block_size;
            let o = block_size - (I2 + K1 + 2 * C2);
            let p = &mut self.c[0].buf;
            p.fill(0);
            item::write_fake_root_item(p, o);
            block::set_dir_end(p, DIR_START + D2);
            block::setd(p, DIR_START, o);
            let free = o as i32 - (DIR_START + D2);
            block::set_max_free(p, free);
            block::set_total_free(p, free);
            block::set_level(p, 0);

            if !self.writable {
                // Reading: any revision not above the snapshot will do.
                block::set_revision(p, 0);
                self.c[0].n = Some(0);
            } else {
                block::set_revision(p, self.latest_revision + 1);
                let n = self.base.next_free_block();
                self.c[0].n = Some(n);
            }
        } else {
            self.block_to_cursor(self.level, self.root)?;
            if block::revision(&self.c[self.level].buf) > self.revision {
                return Err(self.set_overwritten());
            }
        }
        Ok(())
    }

    // ---------------- block movement ----------------

    /// Highest block currently in use, bounding sequential leaf scans.
    pub(crate) fn base_last_block(&self) -> u32 {
        self.base.last_block()
    }

    pub(crate) fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| TableError::storage("data file is not open"))?;
        io::read_block(file, self.block_size, n, buf)
    }

    /// Writes a block, deleting the stale alternate base first if this is
    /// the transaction's first write.
    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<()> {
        debug_assert!(self.writable);
        debug_assert!(self.dangerous || self.base.block_free_at_start(n));

        if self.both_bases {
            // Once a block of the old revision is overwritten the other
            // base must never be opened again.
            io::unlink_tolerant(&self.base_path(self.other_letter()));
            self.both_bases = false;
            self.latest_revision = self.revision;
        }

        let file = self
            .file
            .as_ref()
            .ok_or_else(|| TableError::storage("data file is not open"))?;
        io::write_block(file, self.block_size, n, buf)
    }

    /// The error for observing a block newer than the snapshot: corruption
    /// for the writer (there should be no other writer), a discarded
    /// revision for a reader.
    pub(crate) fn set_overwritten(&self) -> eyre::Report {
        if self.writable {
            TableError::corrupt("block overwritten - are there multiple writers?")
        } else {
            TableError::Modified.into()
        }
    }

    /// Writes the built-in cursor's block at level `j` back to disk if it
    /// is dirty.
    fn flush_level(&mut self, j: usize) -> Result<()> {
        if !self.c[j].rewrite {
            return Ok(());
        }
        let n = self.c[j]
            .n
            .ok_or_else(|| TableError::corrupt("dirty cursor level without a block number"))?;
        let buf = mem::take(&mut self.c[j].buf);
        let result = self.write_block(n, &buf);
        self.c[j].buf = buf;
        self.c[j].rewrite = false;
        result
    }

    /// Puts block `n` into level `j` of the built-in cursor, flushing
    /// whatever dirty block occupied that level.
    fn block_to_cursor(&mut self, j: usize, n: u32) -> Result<()> {
        if self.c[j].n == Some(n) {
            return Ok(());
        }
        self.flush_level(j)?;

        let mut buf = mem::take(&mut self.c[j].buf);
        let result = self.read_block(n, &mut buf);
        self.c[j].buf = buf;
        result?;
        self.c[j].n = Some(n);

        if j < self.level
            && block::revision(&self.c[j].buf) > block::revision(&self.c[j + 1].buf)
        {
            return Err(self.set_overwritten());
        }
        if block::level(&self.c[j].buf) != j as u8 {
            return Err(TableError::corrupt(format!(
                "block {n} has level {} but was reached at level {j}",
                block::level(&self.c[j].buf)
            )));
        }
        Ok(())
    }

    /// Navigation for an external read cursor: never flushes, but picks up
    /// the writer's in-memory copy of a block the built-in cursor holds.
    pub(crate) fn block_to_cursor_read(
        &self,
        cur: &mut [CursorLevel],
        j: usize,
        n: u32,
    ) -> Result<()> {
        if cur[j].n == Some(n) {
            return Ok(());
        }
        debug_assert!(!cur[j].rewrite);

        if self.writable && self.c[j].n == Some(n) {
            cur[j].buf.copy_from_slice(&self.c[j].buf);
        } else {
            self.read_block(n, &mut cur[j].buf)?;
        }
        cur[j].n = Some(n);

        if j < self.level && block::revision(&cur[j].buf) > block::revision(&cur[j + 1].buf) {
            return Err(self.set_overwritten());
        }
        if block::level(&cur[j].buf) != j as u8 {
            return Err(TableError::corrupt(format!(
                "block {n} has level {} but was reached at level {j}",
                block::level(&cur[j].buf)
            )));
        }
        Ok(())
    }

    // ---------------- search ----------------

    /// Positions the built-in cursor at the greatest key less than or equal
    /// to the formed key in `kt`. Returns whether the key matched exactly.
    fn find(&mut self) -> Result<bool> {
        for j in (1..=self.level).rev() {
            let c = block::find_in_block(&self.c[j].buf, self.kt.key(), false, self.c[j].c);
            self.c[j].c = c;
            let child = block::item_at(&self.c[j].buf, c).block_given_by();
            self.block_to_cursor(j - 1, child)?;
        }
        let c = block::find_in_block(&self.c[0].buf, self.kt.key(), true, self.c[0].c);
        self.c[0].c = c;
        Ok(c >= DIR_START && block::item_at(&self.c[0].buf, c).key() == self.kt.key())
    }

    /// Search for an external cursor, descending into `cur`'s own buffers.
    pub(crate) fn find_read(&self, cur: &mut [CursorLevel], key: Key<'_>) -> Result<bool> {
        for j in (1..=self.level).rev() {
            let c = block::find_in_block(&cur[j].buf, key, false, cur[j].c);
            cur[j].c = c;
            let child = block::item_at(&cur[j].buf, c).block_given_by();
            self.block_to_cursor_read(cur, j - 1, child)?;
        }
        let c = block::find_in_block(&cur[0].buf, key, true, cur[0].c);
        cur[0].c = c;
        if c < DIR_START {
            return Ok(false);
        }
        Ok(block::item_at(&cur[0].buf, c).key() == key)
    }

    // ---------------- mutation engine ----------------

    /// Prepares the cursor path for modification, giving copy-on-write
    /// copies fresh block numbers from leaf to root.
    ///
    /// The early exits matter: a level already marked for rewrite implies
    /// the whole path above it has been adapted, and a block that was free
    /// at the start of the transaction can be rewritten in place.
    fn alter(&mut self) -> Result<()> {
        debug_assert!(self.writable);
        if self.dangerous {
            self.c[0].rewrite = true;
            return Ok(());
        }
        let mut j = 0;
        loop {
            if self.c[j].rewrite {
                return Ok(());
            }
            self.c[j].rewrite = true;

            let n = self.c[j]
                .n
                .ok_or_else(|| TableError::corrupt("altering an unloaded cursor level"))?;
            if self.base.block_free_at_start(n) {
                return Ok(());
            }

            self.base.free_block(n);
            let n_new = self.base.next_free_block();
            self.c[j].n = Some(n_new);
            block::set_revision(&mut self.c[j].buf, self.latest_revision + 1);

            if j == self.level {
                return Ok(());
            }
            j += 1;
            let c = self.c[j].c;
            let o = block::getd(&self.c[j].buf, c);
            item::set_block_given_by(&mut self.c[j].buf, o, n_new);
        }
    }

    /// Adds `item` to the block at cursor level `j`, splitting it when
    /// there is no room.
    fn add_item(&mut self, item_bytes: &[u8], j: usize) -> Result<()> {
        debug_assert!(self.writable);
        let needed = item_bytes.len() as i32 + D2;
        let landed_n;
        let landed_c;

        if block::total_free(&self.c[j].buf) < needed {
            // Split: the lower half goes to a fresh copy in the scratch
            // split buffer, the upper half stays in p under a new number.
            let mut c = self.c[j].c;
            let m = if self.seq_count < 0 {
                block::mid_point(&self.c[j].buf)
            } else {
                c
            };

            let split_n = self.c[j]
                .n
                .ok_or_else(|| TableError::corrupt("splitting an unloaded block"))?;
            self.c[j].n = Some(self.base.next_free_block());

            let mut p = mem::take(&mut self.c[j].buf);
            let mut split_p = mem::take(&mut self.split_buf);
            let mut scratch = mem::take(&mut self.scratch);

            split_p.copy_from_slice(&p);
            block::set_dir_end(&mut split_p, m);
            block::compact(&mut split_p, &mut scratch);

            let residue = block::dir_end(&p) - m;
            let new_dir_end = DIR_START + residue;
            p.copy_within(m as usize..(m + residue) as usize, DIR_START as usize);
            block::set_dir_end(&mut p, new_dir_end);
            block::compact(&mut p, &mut scratch);

            let add_to_upper = if self.seq_count < 0 {
                c >= m
            } else {
                // Sequential: fill the lower half as long as it has room.
                block::total_free(&split_p) < needed
            };

            if add_to_upper {
                c -= m - DIR_START;
                debug_assert!(c >= DIR_START);
                block::add_item_to_block(&mut p, &mut scratch, item_bytes, c);
                landed_n = self.c[j].n;
            } else {
                debug_assert!(c >= DIR_START);
                block::add_item_to_block(&mut split_p, &mut scratch, item_bytes, c);
                landed_n = Some(split_n);
            }
            landed_c = c;

            self.c[j].buf = p;
            self.scratch = scratch;

            self.write_block(split_n, &split_p)?;

            if j == self.level {
                self.split_root(split_n)?;
            }

            // Separator between the last key of the lower half and the
            // first key of the upper half.
            let prev_key = block::item_at(&split_p, block::dir_end(&split_p) - D2)
                .key()
                .to_owned();
            let new_key = block::item_at(&self.c[j].buf, DIR_START).key().to_owned();
            self.split_buf = split_p;

            self.enter_key(j + 1, prev_key, new_key)?;
        } else {
            let c = self.c[j].c;
            let mut p = mem::take(&mut self.c[j].buf);
            let mut scratch = mem::take(&mut self.scratch);
            block::add_item_to_block(&mut p, &mut scratch, item_bytes, c);
            self.c[j].buf = p;
            self.scratch = scratch;
            landed_n = self.c[j].n;
            landed_c = c;
        }

        if j == 0 {
            self.changed_n = landed_n;
            self.changed_c = landed_c;
        }
        Ok(())
    }

    /// The root split: gain a level whose single null-key item points at
    /// the lower half of the old root.
    fn split_root(&mut self, split_n: u32) -> Result<()> {
        self.level += 1;
        if self.level == BTREE_CURSOR_LEVELS {
            return Err(TableError::corrupt(format!(
                "B-tree has grown impossibly large ({BTREE_CURSOR_LEVELS} levels)"
            )));
        }

        let mut top = CursorLevel::new(self.block_size);
        top.c = DIR_START;
        top.n = Some(self.base.next_free_block());
        top.rewrite = true;
        block::set_revision(&mut top.buf, self.latest_revision + 1);
        block::set_level(&mut top.buf, self.level as u8);
        block::set_dir_end(&mut top.buf, DIR_START);
        let mut scratch = mem::take(&mut self.scratch);
        block::compact(&mut top.buf, &mut scratch);
        self.scratch = scratch;
        self.c.push(top);

        let item = item::null_item(split_n);
        self.add_item(&item, self.level)
    }

    /// Enters a separator key at level `j` for the block now at `j - 1`.
    ///
    /// At level 1 the separator is truncated to the shortest prefix of
    /// `new_key` that still sorts after `prev_key`; between higher levels
    /// no truncation is possible since the keys there are already
    /// truncated. Above level 1 the child block's first key is replaced by
    /// a null key, its bytes credited back to the free count.
    fn enter_key(&mut self, j: usize, prev_key: item::KeyBuf, new_key: item::KeyBuf) -> Result<()> {
        debug_assert!(j >= 1);
        debug_assert!(prev_key.as_key() < new_key.as_key());

        let block_number = self.c[j - 1]
            .n
            .ok_or_else(|| TableError::corrupt("separator for an unloaded block"))?;

        let new_key_len = new_key.as_key().len();
        let truncate_to = if j == 1 {
            let newb = new_key.as_key().body();
            let prevb = prev_key.as_key().body();
            let min_len = newb.len().min(prevb.len());
            let mut i = 0;
            while i < min_len && prevb[i] == newb[i] {
                i += 1;
            }
            // One byte of difference.
            if i < new_key_len {
                i += 1;
            }
            i
        } else {
            new_key_len
        };

        let sep = item::branch_item(new_key.as_key(), truncate_to, block_number);

        if j > 1 {
            let p = &mut self.c[j - 1].buf;
            let o = block::getd(p, DIR_START);
            let child = Item::at(p, o).block_given_by();
            item::form_null_key(p, o, child);
            let freed = (new_key_len + C2) as i32;
            let total = block::total_free(p) + freed;
            block::set_total_free(p, total);
        }

        let c = block::find_in_block(&self.c[j].buf, Item::at(&sep, 0).key(), false, 0) + D2;
        self.c[j].c = c;
        self.c[j].rewrite = true;
        self.add_item(&sep, j)
    }

    /// Removes the item at cursor level `j`. With `repeatedly`, an emptied
    /// block is freed and its parent entry removed in turn; an emptied (or
    /// single-entry) root loses a level.
    fn delete_item(&mut self, j: usize, repeatedly: bool) -> Result<()> {
        debug_assert!(self.writable);
        let c = self.c[j].c;
        block::delete_item_from_block(&mut self.c[j].buf, c);

        if !repeatedly {
            return Ok(());
        }
        if j < self.level {
            if block::dir_end(&self.c[j].buf) == DIR_START {
                let n = self.c[j]
                    .n
                    .ok_or_else(|| TableError::corrupt("freeing an unloaded block"))?;
                self.base.free_block(n);
                self.c[j].rewrite = false;
                self.c[j].n = None;
                self.c[j + 1].rewrite = true;
                self.delete_item(j + 1, true)?;
            }
        } else {
            while block::dir_end(&self.c[self.level].buf) == DIR_START + D2 && self.level > 0 {
                // A single item in the root: make its child the new root.
                let new_root =
                    block::item_at(&self.c[self.level].buf, DIR_START).block_given_by();
                let n = self.c[self.level]
                    .n
                    .ok_or_else(|| TableError::corrupt("freeing an unloaded root"))?;
                self.base.free_block(n);
                self.c.pop();
                self.level -= 1;
                self.block_to_cursor(self.level, new_root)?;
            }
        }
        Ok(())
    }

    /// Inserts or replaces the item formed in `kt`, with the cursor already
    /// positioned by `find` (whose result is `found`). Returns the
    /// component total of a replaced item, 0 otherwise.
    fn add_kt(&mut self, found: bool) -> Result<u16> {
        debug_assert!(self.writable);
        let mut components = 0;

        self.alter()?;

        if found {
            // Replacement never counts toward a sequential run.
            self.seq_count = SEQ_START_POINT;
            self.sequential = false;

            let kt = mem::take(&mut self.kt);
            let kt_bytes = kt.as_bytes();
            let kt_size = kt_bytes.len() as i32;
            let mut the_long_way = false;
            {
                let c = self.c[0].c;
                let p = &mut self.c[0].buf;
                let o = block::getd(p, c);
                let old = Item::at(p, o);
                components = old.components_of();
                let needed = kt_size - old.size() as i32;

                if needed <= 0 {
                    // Overwrite in place; the slack stays inside the block.
                    p[o..o + kt_bytes.len()].copy_from_slice(kt_bytes);
                    let total = block::total_free(p) - needed;
                    block::set_total_free(p, total);
                } else {
                    let new_max = block::max_free(p) - kt_size;
                    if new_max >= 0 {
                        let o2 = (block::dir_end(p) + new_max) as usize;
                        p[o2..o2 + kt_bytes.len()].copy_from_slice(kt_bytes);
                        block::setd(p, c, o2);
                        block::set_max_free(p, new_max);
                        let total = block::total_free(p) - needed;
                        block::set_total_free(p, total);
                    } else {
                        the_long_way = true;
                    }
                }
            }
            if the_long_way {
                self.delete_item(0, false)?;
                self.add_item(kt.as_bytes(), 0)?;
            }
            self.kt = kt;
        } else {
            if self.changed_n.is_some()
                && self.changed_n == self.c[0].n
                && self.changed_c == self.c[0].c
            {
                if self.seq_count < 0 {
                    self.seq_count += 1;
                }
            } else {
                self.seq_count = SEQ_START_POINT;
                self.sequential = false;
            }
            self.c[0].c += D2;
            let kt = mem::take(&mut self.kt);
            let result = self.add_item(kt.as_bytes(), 0);
            self.kt = kt;
            result?;
        }
        Ok(components)
    }

    /// Deletes the item whose key is formed in `kt`, if present. Returns
    /// its component total, 0 when absent.
    fn delete_kt(&mut self) -> Result<u16> {
        debug_assert!(self.writable);
        let found = self.find()?;

        self.seq_count = SEQ_START_POINT;
        self.sequential = false;

        let mut components = 0;
        if found {
            components = block::item_at(&self.c[0].buf, self.c[0].c).components_of();
            self.alter()?;
            self.delete_item(0, true)?;
        }
        Ok(components)
    }

    // ---------------- public mutation ----------------

    /// Inserts `tag` under `key`, replacing any existing entry. With
    /// `already_compressed` the tag is taken to be raw-deflate data and is
    /// stored verbatim with the compressed flag set.
    pub fn add(&mut self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<()> {
        trace!(table = %self.tablename, key_len = key.len(), tag_len = tag.len(), "add");
        self.check_writable()?;

        if self.file.is_none() {
            let block_size = self.block_size;
            self.create_and_open(block_size)?;
        }

        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(TableError::unimplemented(format!(
                "key length {} outside 1..={MAX_KEY_LEN}",
                key.len()
            )));
        }

        self.kt.form_key(key);

        let mut compressed = false;
        let mut packed = None;
        if already_compressed {
            compressed = true;
        } else if self.compress_strategy != CompressStrategy::DontCompress
            && tag.len() > COMPRESS_MIN
        {
            if let Some(out) = self.compressor.compress(tag) {
                packed = Some(out);
                compressed = true;
            }
        }
        let tag: &[u8] = packed.as_deref().unwrap_or(tag);

        // Chunk sizing. cd is the per-item overhead, l the tag bytes any
        // chunk can carry.
        let cd = key.len() + K1 + I2 + C2 + C2;
        let l = self.max_item_size - cd;
        let mut first_l = l;

        let mut found = self.find()?;
        if !found {
            let residue =
                block::total_free(&self.c[0].buf) as usize % (self.max_item_size + D2 as usize);
            if residue > D2 as usize + cd {
                let n = residue - (D2 as usize + cd);
                // When n is at least the natural final chunk, filling this
                // block exactly costs no extra item. Under full compaction
                // pack tighter, but not below key.len() + slack: shorter
                // first chunks start needing longer dividing keys.
                let last = tag.len() % l;
                if n >= last || (self.full_compaction && n >= key.len() + FULL_COMPACTION_SLACK) {
                    first_l = n;
                }
            }
        }

        let m = if tag.is_empty() {
            1
        } else {
            (tag.len() + l - 1 - first_l) / l + 1
        };
        if m >= MAX_COMPONENTS {
            return Err(TableError::unimplemented(
                "can't handle insanely large tags",
            ));
        }

        self.kt.set_components_of(m as u16);

        let mut o = 0;
        let mut residue = tag.len();
        let mut replaced_components = 0;
        let mut replacement = false;
        for i in 1..=m {
            let chunk = if i == m {
                residue
            } else if i == 1 {
                first_l
            } else {
                l
            };
            debug_assert!(cd + chunk <= self.block_size);

            self.kt.set_component_of(i as u16);
            self.kt.set_tag(cd, &tag[o..o + chunk], compressed);
            o += chunk;
            residue -= chunk;

            if i > 1 {
                found = self.find()?;
            }
            replaced_components = self.add_kt(found)?;
            if replaced_components > 0 {
                replacement = true;
            }
        }

        // A shorter replacement leaves components of the old entry behind.
        for i in (m as u16 + 1)..=replaced_components {
            self.kt.set_component_of(i);
            self.delete_kt()?;
        }

        if !replacement {
            self.item_count += 1;
        }
        self.modified = true;
        Ok(())
    }

    /// Deletes `key`, reporting whether it was present. Empty or oversized
    /// keys cannot be present and return `false` without error.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        trace!(table = %self.tablename, key_len = key.len(), "del");
        self.check_writable()?;
        if self.file.is_none() {
            return Ok(false);
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }

        self.kt.form_key(key);
        let components = self.delete_kt()?;
        if components == 0 {
            return Ok(false);
        }
        for i in 2..=components {
            self.kt.set_component_of(i);
            self.delete_kt()?;
        }

        self.item_count -= 1;
        self.modified = true;
        Ok(true)
    }

    // ---------------- reading ----------------

    /// Point lookup: reassembles the tag stored under `key` into `tag`.
    pub fn get_exact_entry(&mut self, key: &[u8], tag: &mut Vec<u8>) -> Result<bool> {
        trace!(table = %self.tablename, key_len = key.len(), "get_exact_entry");
        self.check_open()?;
        if self.file.is_none() {
            return Ok(false);
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }

        self.kt.form_key(key);
        if !self.find()? {
            return Ok(false);
        }
        self.read_tag_builtin(tag)?;
        Ok(true)
    }

    /// Presence test without reading the tag.
    pub fn key_exists(&mut self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        if self.file.is_none() {
            return Ok(false);
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        self.kt.form_key(key);
        self.find()
    }

    /// Reassembles the tag under the built-in cursor, following
    /// continuation items and inflating if the leading item is flagged
    /// compressed.
    fn read_tag_builtin(&mut self, tag: &mut Vec<u8>) -> Result<()> {
        tag.clear();
        let (n, compressed) = {
            let item = block::item_at(&self.c[0].buf, self.c[0].c);
            (item.components_of(), item.compressed())
        };
        if n > 1 {
            tag.reserve((self.max_item_size - (1 + K1 + I2 + 2 * C2)) * n as usize);
        }
        block::item_at(&self.c[0].buf, self.c[0].c).append_chunk(tag);

        for i in 2..=n {
            if !self.next_builtin(0)? {
                return Err(TableError::corrupt(
                    "unexpected end of table when reading continuation of tag",
                ));
            }
            let item = block::item_at(&self.c[0].buf, self.c[0].c);
            if item.component_of() != i {
                return Err(TableError::corrupt("tag continuation item is missing"));
            }
            item.append_chunk(tag);
        }

        if compressed {
            let packed = mem::take(tag);
            self.compressor.decompress(&packed, tag)?;
        }
        Ok(())
    }

    /// Forward step of the built-in cursor.
    fn next_builtin(&mut self, j: usize) -> Result<bool> {
        if j == 0 && self.sequential {
            return self.next_builtin_sequential();
        }
        self.next_builtin_default(j)
    }

    fn next_builtin_default(&mut self, j: usize) -> Result<bool> {
        let mut c = self.c[j].c + D2;
        if c >= block::dir_end(&self.c[j].buf) {
            if j == self.level {
                return Ok(false);
            }
            if !self.next_builtin_default(j + 1)? {
                return Ok(false);
            }
            c = DIR_START;
        }
        self.c[j].c = c;
        if j > 0 {
            let child = block::item_at(&self.c[j].buf, c).block_given_by();
            self.block_to_cursor(j - 1, child)?;
        }
        Ok(true)
    }

    /// Sequential fast path: walk leaf blocks by number. Blocks held
    /// modified in upper cursor levels are not yet valid on disk and are
    /// skipped.
    fn next_builtin_sequential(&mut self) -> Result<bool> {
        let mut c = self.c[0].c + D2;
        if c == block::dir_end(&self.c[0].buf) {
            self.flush_level(0)?;
            let mut n = self.c[0]
                .n
                .ok_or_else(|| TableError::corrupt("sequential scan from an unloaded leaf"))?;
            loop {
                n = match n.checked_add(1) {
                    Some(n) => n,
                    None => return Ok(false),
                };
                if n > self.base.last_block() {
                    return Ok(false);
                }
                if (1..=self.level).any(|j| self.c[j].n == Some(n)) {
                    continue;
                }
                let mut buf = mem::take(&mut self.c[0].buf);
                let result = self.read_block(n, &mut buf);
                self.c[0].buf = buf;
                result?;
                self.c[0].n = Some(n);
                if block::revision(&self.c[0].buf) > self.revision + u32::from(self.writable) {
                    return Err(self.set_overwritten());
                }
                if block::level(&self.c[0].buf) == 0 {
                    break;
                }
            }
            c = DIR_START;
        }
        self.c[0].c = c;
        Ok(true)
    }

    /// Creates a read-only cursor over the table's current state. The
    /// cursor borrows the table, so the snapshot cannot shift under it
    /// within this handle.
    pub fn cursor_get(&self) -> Result<Cursor<'_>> {
        self.check_open()?;
        if self.file.is_none() {
            return Err(TableError::storage("table is not open"));
        }
        Ok(Cursor::new(self))
    }

    // ---------------- commit / cancel ----------------

    /// Commits the accumulated modifications as `revision`, which must
    /// exceed the current one.
    pub fn commit(&mut self, revision: u32) -> Result<()> {
        self.commit_inner(revision, None)
    }

    /// Like [`commit`](Self::commit), also exporting a base record followed
    /// by `changes_tail` to a changes stream.
    pub fn commit_with_changes<W: Write>(
        &mut self,
        revision: u32,
        changes: &mut W,
        changes_tail: &[u8],
    ) -> Result<()> {
        self.commit_inner(revision, Some((changes as &mut dyn Write, changes_tail)))
    }

    fn commit_inner(
        &mut self,
        revision: u32,
        changes: Option<(&mut dyn Write, &[u8])>,
    ) -> Result<()> {
        debug!(table = %self.tablename, revision, "commit");
        self.check_writable()?;

        if revision <= self.revision {
            return Err(TableError::storage("new revision too low"));
        }

        if self.file.is_none() {
            self.latest_revision = revision;
            self.revision = revision;
            return Ok(());
        }

        let result = self.commit_body(revision, changes);
        if result.is_err() {
            // Leave reopening to cancel(), which rebuilds from the last
            // good base.
            self.close(false);
        }
        result
    }

    fn commit_body(
        &mut self,
        revision: u32,
        changes: Option<(&mut dyn Write, &[u8])>,
    ) -> Result<()> {
        for j in (0..=self.level).rev() {
            self.flush_level(j)?;
        }
        if self.modified {
            self.faked_root_block = false;
        }
        if self.faked_root_block {
            // Nothing was ever written; commit an empty bitmap.
            self.base.clear_bit_map();
        }

        let root = self.c[self.level]
            .n
            .ok_or_else(|| TableError::corrupt("no root block at commit"))?;

        self.base.set_revision(revision);
        self.base.set_block_size(self.block_size as u32);
        self.base.set_root(root);
        self.base.set_level(self.level);
        self.base.set_item_count(self.item_count);
        self.base.set_have_fakeroot(self.faked_root_block);
        self.base.set_sequential(self.sequential);
        self.base.set_dangerous(self.dangerous);

        self.base_letter = self.other_letter();
        self.both_bases = true;
        self.latest_revision = revision;
        self.revision = revision;
        self.root = root;
        self.modified = false;

        for level in &mut self.c {
            level.n = None;
            level.c = -1;
            level.rewrite = false;
        }

        // As late as possible, to give in-flight writes the most time.
        {
            let file = self
                .file
                .as_ref()
                .ok_or_else(|| TableError::storage("data file is not open"))?;
            if let Err(e) = io::sync(file) {
                self.file = None;
                return Err(e.wrap_err("can't commit new revision - failed to flush DB to disk"));
            }
        }

        // Readers must never see a partially written base, hence the
        // write-to-temp-then-rename.
        let tmp = self.file_path("tmp");
        let basefile = self.base_path(self.base_letter);
        self.base
            .write_to_file(&tmp, self.base_letter, &self.tablename, changes)?;
        io::rename_base(&tmp, &basefile)?;
        self.base.commit();

        self.read_root()?;

        self.changed_n = Some(0);
        self.changed_c = DIR_START;
        self.seq_count = SEQ_START_POINT;
        Ok(())
    }

    /// Exports every block written by the open transaction as
    /// `pack_uint(n + 1) · block bytes` pairs, framed by a table preamble
    /// and a zero terminator.
    pub fn write_changed_blocks<W: Write>(&mut self, out: &mut W) -> Result<()> {
        self.check_writable()?;
        if self.file.is_none() {
            return Ok(());
        }
        for j in (0..=self.level).rev() {
            self.flush_level(j)?;
        }
        if self.modified {
            self.faked_root_block = false;
        }
        if self.faked_root_block {
            return Ok(());
        }

        let write_err =
            |e: std::io::Error| TableError::storage(format!("couldn't write changes stream: {e}"));

        let mut buf = Vec::new();
        pack_uint(&mut buf, CHANGES_BLOCKS);
        pack_uint(&mut buf, self.tablename.len() as u32);
        buf.extend_from_slice(self.tablename.as_bytes());
        pack_uint(&mut buf, self.block_size as u32);
        out.write_all(&buf).map_err(write_err)?;

        let mut block_buf = vec![0u8; self.block_size];
        let mut n = 0;
        while let Some(changed) = self.base.find_changed_block(n) {
            buf.clear();
            pack_uint(&mut buf, changed + 1);
            out.write_all(&buf).map_err(write_err)?;

            self.read_block(changed, &mut block_buf)?;
            out.write_all(&block_buf).map_err(write_err)?;
            n = changed + 1;
        }
        buf.clear();
        pack_uint(&mut buf, 0);
        out.write_all(&buf).map_err(write_err)?;
        Ok(())
    }

    /// Discards the open transaction, restoring the state of the last good
    /// base, even after a failed commit has closed the data file.
    pub fn cancel(&mut self) -> Result<()> {
        debug!(table = %self.tablename, "cancel");
        self.check_writable()?;

        if self.file.is_none() {
            return self.open();
        }

        let base = Base::read(&self.base_path(self.base_letter)).map_err(|e| {
            TableError::corrupt(format!("couldn't reread base {}: {e:#}", self.base_letter))
        })?;

        self.revision = base.revision();
        self.block_size = base.block_size() as usize;
        self.root = base.root();
        self.level = base.level();
        self.item_count = base.item_count();
        self.faked_root_block = base.have_fakeroot();
        self.sequential = base.sequential();
        self.base = base;
        self.latest_revision = self.revision;
        self.modified = false;

        while self.c.len() < self.level + 1 {
            self.c.push(CursorLevel::new(self.block_size));
        }
        self.c.truncate(self.level + 1);
        for level in &mut self.c {
            level.n = None;
            level.c = -1;
            level.rewrite = false;
        }

        self.read_root()?;

        self.changed_n = Some(0);
        self.changed_c = DIR_START;
        self.seq_count = SEQ_START_POINT;
        Ok(())
    }
}
