//! # Block Layout
//!
//! This module defines the on-disk structure of a B-tree block and the
//! operations that rearrange bytes within one block. Every block of the
//! data file looks like:
//!
//! ```text
//! R L M T D o1 o2 ... oN <gap> [item] ... [item]
//! <--------- D ---------> <-M->
//!
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 0       4     revision    revision at which this block was written
//! 4       1     level       0 for leaves, increasing toward the root
//! 5       2     max_free    size of the gap after the directory
//! 7       2     total_free  total free bytes in the block
//! 9       2     dir_end     offset past the last directory entry
//! 11      2*N   directory   offsets of the N items, in key order
//! ```
//!
//! Items are written from the end of the block toward the directory, so
//! `max_free` is the contiguous run between the directory and the lowest
//! item, while `total_free` additionally counts slack left behind by
//! replacements and deletions. Compaction rewrites all items flush against
//! the end of the block, making the two equal.
//!
//! Directory positions are byte offsets (`DIR_START`, stepping by [`D2`]),
//! kept signed so that "one before the first slot" is representable during
//! leaf searches.

use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::item::{Item, Key};
use crate::zerocopy_accessors;

/// Size of a directory entry in bytes.
pub const D2: i32 = 2;

/// Byte offset of the first directory entry, immediately after the header.
pub const DIR_START: i32 = 11;

/// Maximum number of cursor levels, bounding the tree height.
pub const BTREE_CURSOR_LEVELS: usize = 10;

/// Block sizes must be powers of two within this range.
pub const MIN_BLOCK_SIZE: usize = 2048;
pub const MAX_BLOCK_SIZE: usize = 65536;
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    revision: U32,
    level: u8,
    max_free: U16,
    total_free: U16,
    dir_end: U16,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == DIR_START as usize);

impl BlockHeader {
    pub fn from_bytes(p: &[u8]) -> &Self {
        Self::ref_from_bytes(&p[..DIR_START as usize]).expect("header prefix has exact size")
    }

    pub fn from_bytes_mut(p: &mut [u8]) -> &mut Self {
        Self::mut_from_bytes(&mut p[..DIR_START as usize]).expect("header prefix has exact size")
    }

    zerocopy_accessors! {
        revision: u32,
        level: u8,
    }

    pub fn max_free(&self) -> i32 {
        i32::from(self.max_free.get())
    }

    pub fn set_max_free(&mut self, val: i32) {
        debug_assert!(val >= 0);
        self.max_free = U16::new(val as u16);
    }

    pub fn total_free(&self) -> i32 {
        i32::from(self.total_free.get())
    }

    pub fn set_total_free(&mut self, val: i32) {
        debug_assert!(val >= 0);
        self.total_free = U16::new(val as u16);
    }

    pub fn dir_end(&self) -> i32 {
        i32::from(self.dir_end.get())
    }

    pub fn set_dir_end(&mut self, val: i32) {
        debug_assert!(val >= DIR_START);
        self.dir_end = U16::new(val as u16);
    }
}

#[inline]
pub fn revision(p: &[u8]) -> u32 {
    BlockHeader::from_bytes(p).revision()
}

#[inline]
pub fn set_revision(p: &mut [u8], x: u32) {
    BlockHeader::from_bytes_mut(p).set_revision(x);
}

#[inline]
pub fn level(p: &[u8]) -> u8 {
    BlockHeader::from_bytes(p).level()
}

#[inline]
pub fn set_level(p: &mut [u8], x: u8) {
    BlockHeader::from_bytes_mut(p).set_level(x);
}

#[inline]
pub fn max_free(p: &[u8]) -> i32 {
    BlockHeader::from_bytes(p).max_free()
}

#[inline]
pub fn set_max_free(p: &mut [u8], x: i32) {
    BlockHeader::from_bytes_mut(p).set_max_free(x);
}

#[inline]
pub fn total_free(p: &[u8]) -> i32 {
    BlockHeader::from_bytes(p).total_free()
}

#[inline]
pub fn set_total_free(p: &mut [u8], x: i32) {
    BlockHeader::from_bytes_mut(p).set_total_free(x);
}

#[inline]
pub fn dir_end(p: &[u8]) -> i32 {
    BlockHeader::from_bytes(p).dir_end()
}

#[inline]
pub fn set_dir_end(p: &mut [u8], x: i32) {
    BlockHeader::from_bytes_mut(p).set_dir_end(x);
}

/// Reads directory entry `c`: the byte offset of its item.
#[inline]
pub fn getd(p: &[u8], c: i32) -> usize {
    let c = c as usize;
    u16::from_be_bytes([p[c], p[c + 1]]) as usize
}

/// Writes directory entry `c`.
#[inline]
pub fn setd(p: &mut [u8], c: i32, o: usize) {
    let c = c as usize;
    p[c..c + 2].copy_from_slice(&(o as u16).to_be_bytes());
}

/// The item addressed by directory entry `c`.
#[inline]
pub fn item_at(p: &[u8], c: i32) -> Item<'_> {
    Item::at(p, getd(p, c))
}

/// Rewrites all items flush against the end of the block, so that
/// `max_free` equals `total_free` again.
pub fn compact(p: &mut [u8], scratch: &mut [u8]) {
    let mut e = p.len();
    let dir_end = dir_end(p);
    let mut c = DIR_START;
    while c < dir_end {
        let o = getd(p, c);
        let l = Item::at(p, o).size();
        e -= l;
        scratch[e..e + l].copy_from_slice(&p[o..o + l]);
        setd(p, c, e);
        c += D2;
    }
    p[e..].copy_from_slice(&scratch[e..]);
    let free = e as i32 - dir_end;
    set_total_free(p, free);
    set_max_free(p, free);
}

/// Finds the directory entry splitting the block's item bytes roughly in
/// half.
pub fn mid_point(p: &[u8]) -> i32 {
    let mut n = 0;
    let dir_end = dir_end(p);
    let size = p.len() as i32 - total_free(p) - dir_end;
    let mut c = DIR_START;
    while c < dir_end {
        let l = item_at(p, c).size() as i32;
        n += 2 * l;
        if n >= size {
            if l < n - size {
                return c;
            }
            return c + D2;
        }
        c += D2;
    }
    debug_assert!(false, "mid_point fell off the directory");
    dir_end
}

/// Adds `item` to the block with its directory entry at `c`. The caller has
/// already checked that `total_free` can take the item plus a slot; the
/// block is compacted if the contiguous gap alone cannot.
pub fn add_item_to_block(p: &mut [u8], scratch: &mut [u8], item: &[u8], c: i32) {
    let mut dir_end = dir_end(p);
    let needed = item.len() as i32 + D2;
    let new_total = total_free(p) - needed;
    let mut new_max = max_free(p) - needed;

    debug_assert!(new_total >= 0);

    if new_max < 0 {
        compact(p, scratch);
        new_max = max_free(p) - needed;
        debug_assert!(new_max >= 0);
    }
    debug_assert!(dir_end >= c);

    p.copy_within(c as usize..dir_end as usize, c as usize + D2 as usize);
    dir_end += D2;
    set_dir_end(p, dir_end);

    let o = (dir_end + new_max) as usize;
    setd(p, c, o);
    p[o..o + item.len()].copy_from_slice(item);

    set_max_free(p, new_max);
    set_total_free(p, new_total);
}

/// Removes the directory entry at `c`, returning its item's bytes to the
/// free counts.
pub fn delete_item_from_block(p: &mut [u8], c: i32) {
    let item_len = item_at(p, c).size() as i32;
    let dir_end = dir_end(p) - D2;

    p.copy_within(c as usize + D2 as usize..dir_end as usize + D2 as usize, c as usize);
    set_dir_end(p, dir_end);
    set_max_free(p, max_free(p) + D2);
    set_total_free(p, total_free(p) + item_len + D2);
}

/// Searches the block for `key`, returning the directory entry of the last
/// key less than or equal to it.
///
/// `leaf` is true for a data block and false for an index block, whose
/// first key is a sentinel that must never be tested. For a leaf the result
/// may be `DIR_START - D2`, meaning the search key precedes every item.
///
/// With a hint `c != -1` the slots around `c` are tested first, which makes
/// sequential addition linear rather than logarithmic per step.
pub fn find_in_block(p: &[u8], key: Key<'_>, leaf: bool, c: i32) -> i32 {
    let mut i = DIR_START;
    if leaf {
        i -= D2;
    }
    let mut j = dir_end(p);

    if c != -1 {
        let mut c = c;
        if c < j && i < c && item_at(p, c).key() <= key {
            i = c;
        }
        c += D2;
        if c < j && i < c && key < item_at(p, c).key() {
            j = c;
        }
    }

    while j - i > D2 {
        let k = i + ((j - i) / (D2 * 2)) * D2;
        if key < item_at(p, k).key() {
            j = k;
        } else {
            i = k;
        }
    }
    i
}
