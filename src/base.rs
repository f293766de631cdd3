//! # Base File
//!
//! The base file is the small metadata record that makes a committed
//! revision of a table findable: it names the root block, the tree level,
//! the item count, and carries the allocation bitmap. Two base files exist
//! per table (`baseA`/`baseB`), written in alternation; the one with the
//! higher revision is authoritative, and the other keeps the previous
//! revision readable until the next transaction first writes a block.
//!
//! ## Layout
//!
//! A 32-byte fixed header, the bitmap, then a CRC32 trailer over everything
//! before it. All multi-byte integers are big-endian.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------
//! 0       4     revision
//! 4       4     format_version
//! 8       4     block_size
//! 12      4     root_block_number
//! 16      1     level
//! 17      1     have_fakeroot
//! 18      1     sequential
//! 19      1     dangerous
//! 20      4     item_count
//! 24      4     last_block
//! 28      4     bitmap_length
//! 32      N     bitmap
//! 32+N    4     CRC32 (ISCSI)
//! ```
//!
//! A base that fails any structural check (length, checksum, version,
//! block-size range, level bound, bitmap consistency, root liveness) is
//! rejected as a whole; opening falls back to the other letter.

use std::io::Write;
use std::path::Path;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::bitmap::Bitmap;
use crate::block::{BTREE_CURSOR_LEVELS, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::encoding::pack_uint;
use crate::error::TableError;
use crate::zerocopy_accessors;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 32;

/// Changes-stream discriminator for a serialized base.
pub const CHANGES_BASE: u32 = 1;
/// Changes-stream discriminator for a list of blocks.
pub const CHANGES_BLOCKS: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BaseHeader {
    revision: U32,
    format_version: U32,
    block_size: U32,
    root: U32,
    level: u8,
    have_fakeroot: u8,
    sequential: u8,
    dangerous: u8,
    item_count: U32,
    last_block: U32,
    bitmap_length: U32,
}

const _: () = assert!(std::mem::size_of::<BaseHeader>() == HEADER_SIZE);

impl BaseHeader {
    zerocopy_accessors! {
        revision: u32,
        format_version: u32,
        block_size: u32,
        root: u32,
        level: u8,
        have_fakeroot: u8,
        sequential: u8,
        dangerous: u8,
        item_count: u32,
        last_block: u32,
        bitmap_length: u32,
    }
}

/// In-memory form of one base file, owning the table's allocation bitmap.
#[derive(Debug, Clone, Default)]
pub struct Base {
    revision: u32,
    block_size: u32,
    root: u32,
    level: usize,
    have_fakeroot: bool,
    sequential: bool,
    dangerous: bool,
    item_count: u32,
    bitmap: Bitmap,
}

impl Base {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and validates the base file at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("couldn't read base file '{}'", path.display()))?;
        Self::parse(&bytes).map_err(|e| e.wrap_err(format!("base file '{}'", path.display())))
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE + 4,
            "too short to be a base file: {} bytes",
            bytes.len()
        );

        let body = &bytes[..bytes.len() - 4];
        let stored = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        let computed = CRC32.checksum(body);
        ensure!(
            stored == computed,
            "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
        );

        let header = BaseHeader::ref_from_bytes(&body[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse base header: {e:?}"))?;

        ensure!(
            header.format_version() == FORMAT_VERSION,
            "unsupported base format version {}",
            header.format_version()
        );

        let block_size = header.block_size();
        ensure!(
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&(block_size as usize))
                && block_size.is_power_of_two(),
            "implausible block size {block_size}"
        );

        ensure!(
            (header.level() as usize) < BTREE_CURSOR_LEVELS,
            "level {} exceeds the cursor bound",
            header.level()
        );

        let bitmap_bytes = &body[HEADER_SIZE..];
        ensure!(
            header.bitmap_length() as usize == bitmap_bytes.len(),
            "bitmap length {} disagrees with file size",
            header.bitmap_length()
        );

        let bitmap = Bitmap::from_bytes(bitmap_bytes);
        if header.have_fakeroot() == 0 {
            bitmap.check_block(header.root())?;
            if bitmap.block_free_now(header.root()) {
                bail!("root block {} is not marked in use", header.root());
            }
        }

        Ok(Self {
            revision: header.revision(),
            block_size,
            root: header.root(),
            level: header.level() as usize,
            have_fakeroot: header.have_fakeroot() != 0,
            sequential: header.sequential() != 0,
            dangerous: header.dangerous() != 0,
            item_count: header.item_count(),
            bitmap,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let bitmap = self.bitmap.as_bytes();
        let mut header = BaseHeader::new_zeroed();
        header.set_revision(self.revision);
        header.set_format_version(FORMAT_VERSION);
        header.set_block_size(self.block_size);
        header.set_root(self.root);
        header.set_level(self.level as u8);
        header.set_have_fakeroot(self.have_fakeroot as u8);
        header.set_sequential(self.sequential as u8);
        header.set_dangerous(self.dangerous as u8);
        header.set_item_count(self.item_count);
        header.set_last_block(self.bitmap.last_block().unwrap_or(0));
        header.set_bitmap_length(bitmap.len() as u32);

        let mut out = Vec::with_capacity(HEADER_SIZE + bitmap.len() + 4);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(bitmap);
        let crc = CRC32.checksum(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Serializes this base to `path` (fsynced), optionally appending a base
    /// record plus the caller's tail to a changes stream.
    pub fn write_to_file(
        &self,
        path: &Path,
        letter: char,
        tablename: &str,
        changes: Option<(&mut dyn Write, &[u8])>,
    ) -> Result<()> {
        let serialized = self.serialize();

        let mut file = std::fs::File::create(path)
            .map_err(|e| TableError::storage(format!("couldn't create '{}': {e}", path.display())))?;
        file.write_all(&serialized)
            .and_then(|()| file.sync_all())
            .map_err(|e| TableError::storage(format!("couldn't write '{}': {e}", path.display())))?;

        if let Some((out, tail)) = changes {
            let mut buf = Vec::new();
            pack_uint(&mut buf, CHANGES_BASE);
            pack_uint(&mut buf, tablename.len() as u32);
            buf.extend_from_slice(tablename.as_bytes());
            pack_uint(&mut buf, u32::from(letter as u8));
            pack_uint(&mut buf, serialized.len() as u32);
            buf.extend_from_slice(&serialized);
            buf.extend_from_slice(tail);
            out.write_all(&buf)
                .map_err(|e| TableError::storage(format!("couldn't write changes stream: {e}")))?;
        }
        Ok(())
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn set_root(&mut self, root: u32) {
        self.root = root;
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub fn have_fakeroot(&self) -> bool {
        self.have_fakeroot
    }

    pub fn set_have_fakeroot(&mut self, value: bool) {
        self.have_fakeroot = value;
    }

    pub fn sequential(&self) -> bool {
        self.sequential
    }

    pub fn set_sequential(&mut self, value: bool) {
        self.sequential = value;
    }

    pub fn dangerous(&self) -> bool {
        self.dangerous
    }

    pub fn set_dangerous(&mut self, value: bool) {
        self.dangerous = value;
    }

    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn set_item_count(&mut self, count: u32) {
        self.item_count = count;
    }

    pub fn last_block(&self) -> u32 {
        self.bitmap.last_block().unwrap_or(0)
    }

    pub fn next_free_block(&mut self) -> u32 {
        self.bitmap.next_free_block()
    }

    pub fn free_block(&mut self, n: u32) {
        self.bitmap.free_block(n);
    }

    pub fn block_free_at_start(&self, n: u32) -> bool {
        self.bitmap.block_free_at_start(n)
    }

    pub fn find_changed_block(&self, n: u32) -> Option<u32> {
        self.bitmap.find_changed_block(n)
    }

    pub fn clear_bit_map(&mut self) {
        self.bitmap.clear();
    }

    /// Marks the working bitmap as the new transaction-start state. Called
    /// once the renamed base is in place.
    pub fn commit(&mut self) {
        self.bitmap.commit();
    }
}
