//! # Item and Key Codec
//!
//! This module encodes and decodes the items stored inside B-tree blocks.
//! An item is a key-tag pair laid out as:
//!
//! ```text
//!         I K body x C tag          (leaf blocks)
//!         I K body x child          (internal blocks)
//!           <--K-->
//!         <-------I-------->
//!
//! I      u16  total item length, including I itself
//! K      u8   key length: the K byte, the key body, and the counter
//! body   ..   key body (up to MAX_KEY_LEN bytes)
//! x      u16  component counter, 1-based
//! C      u16  component total; high bit set when the tag is compressed
//! tag    ..   tag chunk (leaf); in internal blocks a u32 child block
//!             number replaces C and the tag
//! ```
//!
//! All integers are big-endian. A tag too long for one item is stored as m
//! items with identical body and counters 1..=m, each carrying total m.
//!
//! ## Null Keys
//!
//! Two degenerate keys exist. Internal blocks start with a sentinel item
//! whose key is just the K byte (`K == 1`: no body, no counter); it is never
//! compared, acting as minus infinity. The faked root of an empty table
//! holds a leaf item with an empty body but a real counter (`K == 3`),
//! which sorts before every real key since key bodies are at least one byte.
//!
//! ## Ordering
//!
//! Keys order by body bytes lexicographically, then by the counter as a
//! big-endian unsigned integer, so the components of a chunked tag sit
//! adjacent and in order.

use smallvec::SmallVec;

/// Bytes holding an item's total length.
pub const I2: usize = 2;
/// Bytes holding a key's length.
pub const K1: usize = 1;
/// Bytes holding a component counter or total.
pub const C2: usize = 2;

/// Longest admissible key body. With the K byte and the counter this fills
/// the key-length byte exactly (252 + 1 + 2 = 255).
pub const MAX_KEY_LEN: usize = 252;

/// Per-item overhead around the key body and tag of a leaf item.
pub const LEAF_OVERHEAD: usize = I2 + K1 + C2 + C2;

/// Component totals must leave the top bit free for the compressed flag.
pub const MAX_COMPONENTS: usize = 0x8000;

const COMPRESSED_FLAG: u16 = 0x8000;

#[inline]
fn get_u16(p: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([p[o], p[o + 1]])
}

#[inline]
fn put_u16(p: &mut [u8], o: usize, v: u16) {
    p[o..o + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn get_u32(p: &[u8], o: usize) -> u32 {
    u32::from_be_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]])
}

#[inline]
fn put_u32(p: &mut [u8], o: usize, v: u32) {
    p[o..o + 4].copy_from_slice(&v.to_be_bytes());
}

/// A borrowed view of an encoded key: the K byte, body, and counter.
#[derive(Clone, Copy, Debug)]
pub struct Key<'a> {
    raw: &'a [u8],
}

impl<'a> Key<'a> {
    /// Wraps the key region starting at the K byte.
    pub fn from_raw(p: &'a [u8]) -> Self {
        let k = p[0] as usize;
        Self { raw: &p[..k] }
    }

    /// Length of the key body.
    pub fn len(&self) -> usize {
        self.raw.len().saturating_sub(K1 + C2)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn body(&self) -> &'a [u8] {
        &self.raw[K1..K1 + self.len()]
    }

    /// The component counter. Null internal keys have none and report 0.
    pub fn count(&self) -> u16 {
        if self.raw.len() < K1 + C2 {
            return 0;
        }
        get_u16(self.raw, self.raw.len() - C2)
    }

    /// The raw encoded form, for copying into a separator.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn to_owned(&self) -> KeyBuf {
        KeyBuf {
            raw: self.raw.to_vec(),
        }
    }
}

impl PartialEq for Key<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.body() == other.body() && self.count() == other.count()
    }
}

impl Eq for Key<'_> {}

impl PartialOrd for Key<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.body()
            .cmp(other.body())
            .then(self.count().cmp(&other.count()))
    }
}

/// An owned encoded key, used where a separator must outlive the block it
/// was read from.
#[derive(Clone, Debug)]
pub struct KeyBuf {
    raw: Vec<u8>,
}

impl KeyBuf {
    pub fn as_key(&self) -> Key<'_> {
        Key { raw: &self.raw }
    }
}

/// Encodes `body` as a search key with counter 1, the counter the leading
/// component of every entry carries.
pub fn search_key(body: &[u8]) -> KeyBuf {
    debug_assert!(body.len() <= MAX_KEY_LEN);
    let mut raw = Vec::with_capacity(K1 + body.len() + C2);
    raw.push((K1 + body.len() + C2) as u8);
    raw.extend_from_slice(body);
    raw.extend_from_slice(&1u16.to_be_bytes());
    KeyBuf { raw }
}

/// A borrowed view of one encoded item.
#[derive(Clone, Copy, Debug)]
pub struct Item<'a> {
    p: &'a [u8],
}

impl<'a> Item<'a> {
    /// Reads the item starting at byte offset `o` of block `p`.
    pub fn at(p: &'a [u8], o: usize) -> Self {
        let size = get_u16(p, o) as usize;
        Self {
            p: &p[o..o + size],
        }
    }

    pub fn size(&self) -> usize {
        self.p.len()
    }

    fn key_len(&self) -> usize {
        self.p[I2] as usize
    }

    pub fn key(&self) -> Key<'a> {
        Key::from_raw(&self.p[I2..])
    }

    /// The component counter of this item.
    pub fn component_of(&self) -> u16 {
        self.key().count()
    }

    /// The component total of a leaf item.
    pub fn components_of(&self) -> u16 {
        get_u16(self.p, I2 + self.key_len()) & !COMPRESSED_FLAG
    }

    /// Whether the (reassembled) tag of a leaf item is compressed.
    pub fn compressed(&self) -> bool {
        get_u16(self.p, I2 + self.key_len()) & COMPRESSED_FLAG != 0
    }

    /// The tag chunk of a leaf item.
    pub fn tag(&self) -> &'a [u8] {
        &self.p[I2 + self.key_len() + C2..]
    }

    pub fn append_chunk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.tag());
    }

    /// The child block number of an internal item.
    pub fn block_given_by(&self) -> u32 {
        get_u32(self.p, self.p.len() - 4)
    }
}

/// Repoints the child block number of the internal item at offset `o`.
pub fn set_block_given_by(p: &mut [u8], o: usize, n: u32) {
    let size = get_u16(p, o) as usize;
    put_u32(p, o + size - 4, n);
}

/// Rewrites the internal item at offset `o` into a null-key item pointing
/// at `n`. The item shrinks in place; the caller accounts the saved bytes.
pub fn form_null_key(p: &mut [u8], o: usize, n: u32) {
    put_u16(p, o, (I2 + K1 + 4) as u16);
    p[o + I2] = K1 as u8;
    put_u32(p, o + I2 + K1, n);
}

/// Encoded size of a null-key internal item.
pub const NULL_ITEM_SIZE: usize = I2 + K1 + 4;

/// Builds a null-key internal item pointing at block `n`.
pub fn null_item(n: u32) -> SmallVec<[u8; 264]> {
    let mut buf = SmallVec::from_elem(0u8, NULL_ITEM_SIZE);
    form_null_key(&mut buf, 0, n);
    buf
}

/// Builds an internal item whose key is `key` truncated to `truncate_to`
/// body bytes (the counter is kept whole) and whose tag is block `n`.
pub fn branch_item(key: Key<'_>, truncate_to: usize, n: u32) -> SmallVec<[u8; 264]> {
    debug_assert!(truncate_to <= key.len());
    let k = K1 + truncate_to + C2;
    let size = I2 + k + 4;
    let mut buf = SmallVec::from_elem(0u8, size);
    put_u16(&mut buf, 0, size as u16);
    buf[I2] = k as u8;
    buf[I2 + K1..I2 + K1 + truncate_to].copy_from_slice(&key.body()[..truncate_to]);
    put_u16(&mut buf, I2 + K1 + truncate_to, key.count());
    put_u32(&mut buf, I2 + k, n);
    buf
}

/// Writes the single leaf item of a faked root: an empty body, counter 1 of
/// 1, and an empty tag.
pub fn write_fake_root_item(p: &mut [u8], o: usize) {
    put_u16(p, o, (I2 + K1 + 2 * C2) as u16);
    p[o + I2] = (K1 + C2) as u8;
    put_u16(p, o + I2 + K1, 1);
    put_u16(p, o + I2 + K1 + C2, 1);
}

/// The table's scratch item. `form_key` fills in the key part; the tag part
/// is set per chunk while a long tag is being split into components.
#[derive(Debug, Default)]
pub struct ItemBuf {
    buf: Vec<u8>,
}

impl ItemBuf {
    pub fn with_capacity(block_size: usize) -> Self {
        Self {
            buf: vec![0; block_size],
        }
    }

    /// Fills in the key part with `key` and counter 1, leaving an empty tag.
    pub fn form_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let k = K1 + key.len() + C2;
        put_u16(&mut self.buf, 0, (I2 + k + C2) as u16);
        self.buf[I2] = k as u8;
        self.buf[I2 + K1..I2 + K1 + key.len()].copy_from_slice(key);
        put_u16(&mut self.buf, I2 + K1 + key.len(), 1);
        put_u16(&mut self.buf, I2 + k, 0);
    }

    fn key_len(&self) -> usize {
        self.buf[I2] as usize
    }

    pub fn key(&self) -> Key<'_> {
        Key::from_raw(&self.buf[I2..])
    }

    /// Byte offset of the tag within the buffer, equal to the per-item
    /// overhead `cd` of the chunking arithmetic.
    pub fn tag_offset(&self) -> usize {
        I2 + self.key_len() + C2
    }

    pub fn set_component_of(&mut self, i: u16) {
        let o = I2 + self.key_len() - C2;
        put_u16(&mut self.buf, o, i);
    }

    pub fn set_components_of(&mut self, m: u16) {
        let o = I2 + self.key_len();
        put_u16(&mut self.buf, o, m);
    }

    /// Installs one tag chunk at offset `cd`, fixing up the item length and
    /// the compressed flag.
    pub fn set_tag(&mut self, cd: usize, chunk: &[u8], compressed: bool) {
        self.buf[cd..cd + chunk.len()].copy_from_slice(chunk);
        put_u16(&mut self.buf, 0, (cd + chunk.len()) as u16);
        if compressed {
            let o = I2 + self.key_len();
            let total = get_u16(&self.buf, o);
            put_u16(&mut self.buf, o, total | COMPRESSED_FLAG);
        }
    }

    pub fn size(&self) -> usize {
        get_u16(&self.buf, 0) as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.size()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_item(key: &[u8], counter: u16, total: u16, tag: &[u8]) -> Vec<u8> {
        let mut kt = ItemBuf::with_capacity(512);
        kt.form_key(key);
        kt.set_components_of(total);
        kt.set_component_of(counter);
        let cd = kt.tag_offset();
        kt.set_tag(cd, tag, false);
        kt.as_bytes().to_vec()
    }

    #[test]
    fn leaf_item_roundtrip() {
        let encoded = leaf_item(b"alpha", 1, 1, b"tag bytes");
        let item = Item::at(&encoded, 0);

        assert_eq!(item.size(), encoded.len());
        assert_eq!(item.key().body(), b"alpha");
        assert_eq!(item.component_of(), 1);
        assert_eq!(item.components_of(), 1);
        assert!(!item.compressed());
        assert_eq!(item.tag(), b"tag bytes");
    }

    #[test]
    fn compressed_flag_does_not_disturb_total() {
        let mut kt = ItemBuf::with_capacity(512);
        kt.form_key(b"k");
        kt.set_components_of(3);
        kt.set_component_of(2);
        let cd = kt.tag_offset();
        kt.set_tag(cd, b"zz", true);

        let bytes = kt.as_bytes().to_vec();
        let item = Item::at(&bytes, 0);
        assert!(item.compressed());
        assert_eq!(item.components_of(), 3);
        assert_eq!(item.component_of(), 2);
    }

    #[test]
    fn key_ordering_is_body_then_counter() {
        let a1 = leaf_item(b"aa", 1, 2, b"");
        let a2 = leaf_item(b"aa", 2, 2, b"");
        let b1 = leaf_item(b"ab", 1, 1, b"");
        let long = leaf_item(b"aaa", 1, 1, b"");

        let ka1 = Item::at(&a1, 0).key();
        let ka2 = Item::at(&a2, 0).key();
        let kb1 = Item::at(&b1, 0).key();
        let klong = Item::at(&long, 0).key();

        assert!(ka1 < ka2);
        assert!(ka2 < klong);
        assert!(klong < kb1);
        assert!(ka1 == Item::at(&a1, 0).key());
    }

    #[test]
    fn counter_orders_as_big_endian() {
        // Counters 255 and 256 differ only across the byte boundary.
        let low = leaf_item(b"k", 255, 300, b"");
        let high = leaf_item(b"k", 256, 300, b"");
        assert!(Item::at(&low, 0).key() < Item::at(&high, 0).key());
    }

    #[test]
    fn branch_item_truncates_body_but_keeps_counter() {
        let full = leaf_item(b"sardine", 9, 9, b"");
        let key = Item::at(&full, 0).key();
        let branch = branch_item(key, 3, 77);

        let item = Item::at(&branch, 0);
        assert_eq!(item.key().body(), b"sar");
        assert_eq!(item.key().count(), 9);
        assert_eq!(item.block_given_by(), 77);
    }

    #[test]
    fn null_item_points_at_block_and_sorts_first() {
        let buf = null_item(42);
        let item = Item::at(&buf, 0);
        assert_eq!(item.size(), NULL_ITEM_SIZE);
        assert_eq!(item.block_given_by(), 42);
        assert!(item.key().is_empty());

        let real = leaf_item(b"\x00", 1, 1, b"");
        assert!(item.key() < Item::at(&real, 0).key());
    }

    #[test]
    fn form_null_key_shrinks_in_place() {
        let mut buf = branch_item(Item::at(&leaf_item(b"walrus", 1, 1, b""), 0).key(), 6, 5)
            .to_vec();
        form_null_key(&mut buf, 0, 5);
        let item = Item::at(&buf, 0);
        assert_eq!(item.size(), NULL_ITEM_SIZE);
        assert_eq!(item.block_given_by(), 5);
    }

    #[test]
    fn set_block_given_by_repoints_child() {
        let mut buf = null_item(1).to_vec();
        set_block_given_by(&mut buf, 0, 99);
        assert_eq!(Item::at(&buf, 0).block_given_by(), 99);
    }

    #[test]
    fn fake_root_item_is_an_empty_single_component() {
        let mut block = vec![0u8; 64];
        write_fake_root_item(&mut block, 10);
        let item = Item::at(&block, 10);
        assert_eq!(item.size(), I2 + K1 + 2 * C2);
        assert!(item.key().is_empty());
        assert_eq!(item.component_of(), 1);
        assert_eq!(item.components_of(), 1);
        assert!(item.tag().is_empty());
    }

    #[test]
    fn formed_key_matches_stored_key() {
        let mut kt = ItemBuf::with_capacity(512);
        kt.form_key(b"needle");
        let stored = leaf_item(b"needle", 1, 4, b"payload");
        assert!(kt.key() == Item::at(&stored, 0).key());
    }
}
