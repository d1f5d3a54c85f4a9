//! Verify, decrypt and decompress one compression block.
//!
//! Decoding may run on a worker thread. It never touches request buffers:
//! the decoded bytes travel back to the service loop, which scatters them.

use crate::codec::CompressionMethod;
use crate::crypto::{decrypt_in_place, sign_block, AesKey, BlockSignature};
use crate::engine::blocks::{CompressedBlockId, CompressedSource};
use crate::error::{IoStoreError, Result};
use crate::pool::{CompressionScratch, PooledScratch};

pub(crate) struct DecodeJob {
    pub block: CompressedBlockId,
    pub source: CompressedSource,
    pub raw_size: usize,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub method: CompressionMethod,
    pub aes_key: Option<AesKey>,
    pub signature: Option<BlockSignature>,
    pub scratch: PooledScratch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Output {
    /// Stored, unencrypted: the raw bytes are the data.
    Source,
    /// Stored, decrypted into `scratch.decrypted`.
    Decrypted,
    Decompressed,
}

/// Recorded and computed hash of a block that failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SignatureMismatch {
    pub expected: BlockSignature,
    pub actual: BlockSignature,
}

pub(crate) struct DecodedBlock {
    pub block: CompressedBlockId,
    pub mismatch: Option<SignatureMismatch>,
    result: Result<Output>,
    source: CompressedSource,
    scratch: PooledScratch,
    uncompressed_size: usize,
}

impl DecodedBlock {
    /// The block's decompressed bytes.
    pub fn bytes(&self) -> Result<&[u8]> {
        let output = self.result.as_ref().map_err(Clone::clone)?;
        let bytes = match output {
            Output::Source => source_bytes(&self.source),
            Output::Decrypted => &self.scratch.decrypted[..],
            Output::Decompressed => &self.scratch.decompressed[..],
        };
        Ok(&bytes[..self.uncompressed_size])
    }
}

fn source_bytes(source: &CompressedSource) -> &[u8] {
    match source {
        CompressedSource::Pending => &[],
        CompressedSource::Shared { buffer, start } => &buffer[*start..],
        CompressedSource::Staged(data) => data,
    }
}

impl DecodeJob {
    pub fn run(self) -> DecodedBlock {
        let DecodeJob {
            block,
            mut source,
            raw_size,
            compressed_size,
            uncompressed_size,
            method,
            aes_key,
            signature,
            mut scratch,
        } = self;

        let mismatch = signature.and_then(|expected| {
            // A short source hashes what it has; decode reports the shortfall.
            let raw = source_bytes(&source);
            let actual = sign_block(raw.get(..raw_size).unwrap_or(raw));
            (actual != expected).then_some(SignatureMismatch { expected, actual })
        });

        let result = decode(&mut source, &mut *scratch, raw_size, compressed_size, uncompressed_size, method, aes_key);
        DecodedBlock { block, mismatch, result, source, scratch, uncompressed_size }
    }
}

fn decode(
    source: &mut CompressedSource,
    scratch: &mut CompressionScratch,
    raw_size: usize,
    compressed_size: usize,
    uncompressed_size: usize,
    method: CompressionMethod,
    aes_key: Option<AesKey>,
) -> Result<Output> {
    if source_bytes(source).len() < raw_size || compressed_size > raw_size {
        return Err(IoStoreError::DecompressionFailed(format!(
            "block holds {} raw bytes, needs {}",
            source_bytes(source).len(),
            raw_size
        )));
    }

    let mut location = Output::Source;
    if let Some(key) = aes_key {
        match source {
            CompressedSource::Staged(data) => decrypt_in_place(&mut data[..raw_size], &key)?,
            CompressedSource::Shared { buffer, start } => {
                // The raw buffer may be shared with other blocks; decrypt a copy.
                scratch.decrypted.clear();
                scratch.decrypted.extend_from_slice(&buffer[*start..*start + raw_size]);
                decrypt_in_place(&mut scratch.decrypted, &key)?;
                location = Output::Decrypted;
            }
            CompressedSource::Pending => {}
        }
    }

    if method.is_none() {
        if uncompressed_size > compressed_size {
            return Err(IoStoreError::DecompressionFailed(format!(
                "stored block is {} bytes, expected {}",
                compressed_size, uncompressed_size
            )));
        }
        return Ok(location);
    }

    let compressed = match location {
        Output::Decrypted => &scratch.decrypted[..compressed_size],
        _ => &source_bytes(source)[..compressed_size],
    };
    scratch.decompressed.resize(uncompressed_size, 0);
    method.decompress(compressed, &mut scratch.decompressed)?;
    Ok(Output::Decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_in_place, AES_KEY_SIZE};
    use crate::pool::{buffer_pool, scratch_pool};
    use std::sync::Arc;

    fn job(source: CompressedSource, raw_size: usize, compressed: usize, uncompressed: usize) -> DecodeJob {
        DecodeJob {
            block: 1,
            source,
            raw_size,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            method: CompressionMethod::None,
            aes_key: None,
            signature: None,
            scratch: scratch_pool(1).acquire().unwrap(),
        }
    }

    #[test]
    fn stored_shared_block_reads_in_place() {
        let pool = buffer_pool(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf[16..26].copy_from_slice(b"0123456789");
        let source = CompressedSource::Shared { buffer: Arc::new(buf), start: 16 };
        let decoded = job(source, 16, 10, 10).run();
        assert_eq!(decoded.mismatch, None);
        assert_eq!(decoded.bytes().unwrap(), b"0123456789");
    }

    #[test]
    fn encrypted_compressed_staged_block() {
        let plain = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        let packed = CompressionMethod::Zlib.compress(&plain).unwrap();
        let mut stored = packed.clone();
        stored.resize(crate::crypto::align_to_aes_block(packed.len() as u64) as usize, 0);
        let key = AesKey([4; AES_KEY_SIZE]);
        encrypt_in_place(&mut stored, &key).unwrap();
        let signature = sign_block(&stored);

        let mut j = job(CompressedSource::Staged(stored.clone()), stored.len(), packed.len(), plain.len());
        j.method = CompressionMethod::Zlib;
        j.aes_key = Some(key);
        j.signature = Some(signature);
        let decoded = j.run();
        assert_eq!(decoded.mismatch, None);
        assert_eq!(decoded.bytes().unwrap(), &plain[..]);
    }

    #[test]
    fn signature_mismatch_still_decodes() {
        let stored = b"hello world\0\0\0\0\0".to_vec();
        let mut j = job(CompressedSource::Staged(stored.clone()), 16, 11, 11);
        j.signature = Some([0; 32]);
        let decoded = j.run();
        assert_eq!(decoded.mismatch, Some(SignatureMismatch { expected: [0; 32], actual: sign_block(&stored) }));
        assert_eq!(decoded.bytes().unwrap(), b"hello world");
    }

    #[test]
    fn short_source_fails() {
        let decoded = job(CompressedSource::Staged(vec![0; 8]), 16, 16, 16).run();
        assert!(matches!(decoded.bytes(), Err(IoStoreError::DecompressionFailed(_))));
    }
}
