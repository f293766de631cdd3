//! # Tag Compression
//!
//! Long tags are optionally stored raw-deflate compressed (no zlib header,
//! no checksum trailer; the base file's CRC and the block structure already
//! guard integrity). Compression is strictly opportunistic:
//!
//! - tags of [`COMPRESS_MIN`] bytes or fewer are never attempted;
//! - the deflate output must be strictly smaller than the input, otherwise
//!   the tag is stored uncompressed and the item's compressed flag stays
//!   clear.
//!
//! The table keeps one [`CompressionContext`] and resets its streams between
//! tags, so steady-state operation allocates nothing but the output buffers.

use eyre::Result;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::TableError;

/// Only try to compress tags longer than this many bytes.
pub const COMPRESS_MIN: usize = 4;

/// Whether and how tags are compressed on `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressStrategy {
    /// Store every tag verbatim.
    DontCompress,
    /// Raw deflate at the default level.
    #[default]
    Deflate,
}

/// Lazily constructed, reusable deflate and inflate streams.
#[derive(Default)]
pub struct CompressionContext {
    deflate: Option<Compress>,
    inflate: Option<Decompress>,
}

impl std::fmt::Debug for CompressionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionContext")
            .field("deflate", &self.deflate.is_some())
            .field("inflate", &self.inflate.is_some())
            .finish()
    }
}

impl CompressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compresses `tag`, returning `None` when the result would not be
    /// strictly smaller (or the data is incompressible enough that deflate
    /// cannot finish within that budget).
    pub fn compress(&mut self, tag: &[u8]) -> Option<Vec<u8>> {
        debug_assert!(tag.len() > COMPRESS_MIN);

        let deflate = match self.deflate.as_mut() {
            Some(d) => {
                d.reset();
                d
            }
            None => self
                .deflate
                .insert(Compress::new(Compression::default(), false)),
        };

        // Capping the output at one byte less than the input makes "didn't
        // finish" synonymous with "not worth storing compressed".
        let mut out = Vec::with_capacity(tag.len() - 1);
        match deflate.compress_vec(tag, &mut out, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Some(out),
            _ => None,
        }
    }

    /// Inflates `tag` onto the end of `out`. Any failure to consume the
    /// whole stream cleanly is corruption: the flag said these bytes were
    /// deflate data.
    pub fn decompress(&mut self, tag: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let inflate = match self.inflate.as_mut() {
            Some(d) => {
                d.reset(false);
                d
            }
            None => self.inflate.insert(Decompress::new(false)),
        };

        out.reserve(tag.len() + tag.len() / 2);
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = inflate.total_in() as usize;
            let produced = out.len();
            let status = inflate
                .decompress_vec(&tag[consumed..], out, FlushDecompress::Finish)
                .map_err(|e| TableError::corrupt(format!("inflate failed: {e}")))?;
            match status {
                Status::StreamEnd => break,
                Status::Ok if inflate.total_in() as usize > consumed || out.len() > produced => {}
                Status::Ok | Status::BufError => {
                    return Err(TableError::corrupt(
                        "compressed tag ended before the deflate stream did",
                    ))
                }
            }
        }
        if inflate.total_in() as usize != tag.len() {
            return Err(TableError::corrupt(
                "compressed tag carries trailing bytes after the deflate stream",
            ));
        }
        Ok(())
    }
}
