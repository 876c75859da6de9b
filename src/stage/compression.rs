use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::unpacker::Unpacker;

use super::{BoxedTransform, StageError, Transform};

/// Largest plaintext block behind one header. Deflate may grow incompressible input by a
/// few bytes, which still fits the 16 bit length field.
const MAX_BLOCK: usize = 16 * 1024;
const HEADER_LEN: usize = 4;
const GROW: usize = 4 * 1024;

#[derive(Debug, Clone, Copy)]
enum Frame {
    Header,
    Body { original_len: usize },
}

/// zlib compression with block framing.
///
/// Every block goes on the wire as `compressed_len: u16 LE`, `original_len: u16 LE`, then
/// the deflate output for that block ending in a sync flush. The deflate and inflate
/// streams live as long as the stage, so later blocks reuse the dictionary built by
/// earlier ones. An optional inner transform (the cipher) sees the framed bytes.
pub struct Zlib {
    inner: Option<BoxedTransform>,
    deflate: Compress,
    inflate: Decompress,
    unpacker: Unpacker<Frame>,
}

impl Zlib {
    pub fn new(inner: Option<BoxedTransform>) -> Self {
        let mut unpacker = Unpacker::new();
        unpacker.expect(HEADER_LEN, Frame::Header);
        Zlib {
            inner,
            deflate: Compress::new(Compression::best(), true),
            inflate: Decompress::new(true),
            unpacker,
        }
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, StageError> {
        let mut framed = Vec::with_capacity(data.len() / 2 + HEADER_LEN);
        for block in data.chunks(MAX_BLOCK) {
            let compressed = self.deflate_block(block)?;
            framed.extend_from_slice(&(compressed.len() as u16).to_le_bytes());
            framed.extend_from_slice(&(block.len() as u16).to_le_bytes());
            framed.extend_from_slice(&compressed);
        }
        Ok(framed)
    }

    fn deflate_block(&mut self, block: &[u8]) -> Result<Vec<u8>, StageError> {
        let mut out = Vec::with_capacity(block.len() + 64);
        let mut consumed = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(GROW);
            }
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(&block[consumed..], &mut out, FlushCompress::Sync)?;
            consumed += (self.deflate.total_in() - before) as usize;

            // The flush is complete once deflate stops short of filling the output.
            if consumed == block.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }

    /// Inflates one block. Output is capped one byte past `original_len`, so a block that
    /// claims a short length cannot expand further than that before it is rejected.
    fn inflate_block(&mut self, data: &[u8], original_len: usize) -> Result<Vec<u8>, StageError> {
        let mut out = Vec::with_capacity(original_len + 1);
        let mut consumed = 0;
        while consumed < data.len() && out.len() <= original_len {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            self.inflate
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)?;
            let read = (self.inflate.total_in() - before_in) as usize;
            consumed += read;

            if read == 0 && self.inflate.total_out() == before_out {
                break;
            }
        }

        if consumed != data.len() || out.len() != original_len {
            return Err(StageError::LengthMismatch {
                expected: original_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }

    fn decompress(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        let mut unpacker = std::mem::take(&mut self.unpacker);
        let mut plain = Vec::new();
        let mut failure = None;

        unpacker.feed(data, |unpacker, frame, bytes| match frame {
            Frame::Header => {
                let compressed_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                let original_len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
                unpacker.expect(compressed_len, Frame::Body { original_len });
                true
            }
            Frame::Body { original_len } => match self.inflate_block(&bytes, original_len) {
                Ok(block) => {
                    plain.extend(block);
                    unpacker.expect(HEADER_LEN, Frame::Header);
                    true
                }
                Err(err) => {
                    failure = Some(err);
                    false
                }
            },
        });

        self.unpacker = unpacker;
        match failure {
            Some(err) => Err(err),
            None => Ok(plain),
        }
    }
}

impl Transform for Zlib {
    fn encrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        let framed = self.compress(&data)?;
        match self.inner.as_mut() {
            Some(inner) => inner.encrypt(framed),
            None => Ok(framed),
        }
    }

    fn decrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        let data = match self.inner.as_mut() {
            Some(inner) => inner.decrypt(data)?,
            None => data,
        };
        self.decompress(data)
    }
}
