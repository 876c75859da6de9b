//! Composable encrypt/decrypt transforms applied to a byte stream.
//!
//! A session holds at most one pipeline. When both a key and compression are configured
//! the pipeline is `Zlib` over `AesCfb128`: blocks are compressed before they are
//! encrypted and decrypted before they are decompressed.

use thiserror::Error;

mod cipher;
mod compression;
mod seed;
mod worker;

pub use cipher::AesCfb128;
pub use compression::Zlib;
pub use seed::{iv_from_seed, MinStd};
pub use worker::{StageHandle, Transformed};

/// A stateful stream transform. Both directions keep independent state, so encrypt and
/// decrypt calls may interleave freely, but calls in one direction must arrive in stream
/// order.
pub trait Transform {
    fn encrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError>;

    /// May return fewer (or more) bytes than it was given when the transform has its own
    /// framing; bytes that do not complete a frame are kept for the next call.
    fn decrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError>;
}

impl<S: Transform + ?Sized> Transform for Box<S> {
    fn encrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        (**self).encrypt(data)
    }

    fn decrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        (**self).decrypt(data)
    }
}

pub type BoxedTransform = Box<dyn Transform + Send>;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("invalid cipher key or iv length")]
    KeyLength,
    #[error("compression failed: {0}")]
    Compress(#[from] flate2::CompressError),
    #[error("decompression failed: {0}")]
    Decompress(#[from] flate2::DecompressError),
    #[error("compressed block decoded to {actual} bytes, header announced {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("stage worker is gone")]
    WorkerGone,
}

/// Builds the pipeline for a connection whose IV derives from `seed`.
///
/// Returns `None` when neither a key nor compression is configured.
pub fn pipeline(
    key: Option<&[u8]>,
    seed: u32,
    compress: bool,
) -> Result<Option<BoxedTransform>, StageError> {
    let cipher = match key {
        Some(key) => Some(Box::new(AesCfb128::new(key, &iv_from_seed(seed))?) as BoxedTransform),
        None => None,
    };

    let pipeline: Option<BoxedTransform> = match (cipher, compress) {
        (cipher, true) => Some(Box::new(Zlib::new(cipher))),
        (Some(cipher), false) => Some(cipher),
        (None, false) => None,
    };
    Ok(pipeline)
}
