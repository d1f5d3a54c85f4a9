//! AES-256 block encryption and SHA-256 block signatures.
//!
//! Containers encrypt each compressed block independently with AES-256 in
//! ECB mode, so every physical span is padded to [`AES_BLOCK_SIZE`] and can be
//! decrypted in place without extra state.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};

use crate::error::{IoStoreError, Result};

pub const AES_BLOCK_SIZE: usize = 16;
pub const AES_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 32;

/// Rounds `size` up to the AES block size.
#[inline]
pub fn align_to_aes_block(size: u64) -> u64 {
    (size + AES_BLOCK_SIZE as u64 - 1) & !(AES_BLOCK_SIZE as u64 - 1)
}

/// A 256-bit AES key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AesKey(pub [u8; AES_KEY_SIZE]);

impl AesKey {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(AesKey(bytes.try_into().ok()?))
    }

    fn cipher(&self) -> Aes256 {
        Aes256::new(GenericArray::from_slice(&self.0))
    }
}

// Keys never appear in logs.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

fn check_aligned(len: usize) -> Result<()> {
    if len % AES_BLOCK_SIZE != 0 {
        return Err(IoStoreError::InvalidParameter(format!(
            "{} bytes is not a multiple of the AES block size",
            len
        )));
    }
    Ok(())
}

/// Encrypts `data` in place. `data.len()` must be block aligned.
pub fn encrypt_in_place(data: &mut [u8], key: &AesKey) -> Result<()> {
    check_aligned(data.len())?;
    let cipher = key.cipher();
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Decrypts `data` in place. `data.len()` must be block aligned.
pub fn decrypt_in_place(data: &mut [u8], key: &AesKey) -> Result<()> {
    check_aligned(data.len())?;
    let cipher = key.cipher();
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Signature of one physical block span.
pub type BlockSignature = [u8; SIGNATURE_SIZE];

pub fn sign_block(data: &[u8]) -> BlockSignature {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_to_aes_block(0), 0);
        assert_eq!(align_to_aes_block(1), 16);
        assert_eq!(align_to_aes_block(16), 16);
        assert_eq!(align_to_aes_block(17), 32);
    }

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let key = AesKey([7u8; AES_KEY_SIZE]);
        let plain: Vec<u8> = (0..64u8).collect();
        let mut data = plain.clone();
        encrypt_in_place(&mut data, &key).unwrap();
        assert_ne!(data, plain);
        decrypt_in_place(&mut data, &key).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn wrong_key_yields_garbage() {
        let mut data = [0x42u8; 32];
        encrypt_in_place(&mut data, &AesKey([1; AES_KEY_SIZE])).unwrap();
        decrypt_in_place(&mut data, &AesKey([2; AES_KEY_SIZE])).unwrap();
        assert_ne!(data, [0x42u8; 32]);
    }

    #[test]
    fn unaligned_input_rejected() {
        let mut data = [0u8; 15];
        assert!(matches!(
            decrypt_in_place(&mut data, &AesKey([0; AES_KEY_SIZE])),
            Err(IoStoreError::InvalidParameter(_))
        ));
    }

    #[test]
    fn signature_detects_single_byte_change() {
        let mut data = vec![0u8; 100];
        let sig = sign_block(&data);
        data[50] ^= 1;
        assert_ne!(sign_block(&data), sig);
    }

    #[test]
    fn key_debug_is_redacted() {
        assert_eq!(format!("{:?}", AesKey([9; AES_KEY_SIZE])), "AesKey(..)");
    }
}
