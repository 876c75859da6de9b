use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{cipher::KeyIvInit, BufDecryptor, BufEncryptor};

use super::{StageError, Transform};

const IV_LEN: usize = 16;

/// AES in 128-bit CFB mode. The key schedule is picked from the password length: up to
/// 16 bytes is AES-128, up to 24 is AES-192, anything longer is AES-256 (truncated to 32
/// bytes). Shorter passwords are zero padded. Both directions carry their own feedback
/// register and keystream position, so partial blocks continue across calls.
pub struct AesCfb128 {
    inner: Keyed,
}

enum Keyed {
    Aes128(BufEncryptor<Aes128>, BufDecryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>, BufDecryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>, BufDecryptor<Aes256>),
}

impl AesCfb128 {
    pub fn new(password: &[u8], iv: &[u8]) -> Result<Self, StageError> {
        let mut key = password.to_vec();
        let key_len = match key.len() {
            0..=16 => 16,
            17..=24 => 24,
            _ => 32,
        };
        key.resize(key_len, 0);

        let mut iv = iv.to_vec();
        iv.resize(IV_LEN, 0);

        let inner = match key_len {
            16 => Keyed::Aes128(keyed(&key, &iv)?, keyed(&key, &iv)?),
            24 => Keyed::Aes192(keyed(&key, &iv)?, keyed(&key, &iv)?),
            _ => Keyed::Aes256(keyed(&key, &iv)?, keyed(&key, &iv)?),
        };
        Ok(AesCfb128 { inner })
    }

    /// Key length in bits.
    pub fn key_bits(&self) -> usize {
        match self.inner {
            Keyed::Aes128(..) => 128,
            Keyed::Aes192(..) => 192,
            Keyed::Aes256(..) => 256,
        }
    }
}

fn keyed<T: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<T, StageError> {
    T::new_from_slices(key, iv).map_err(|_| StageError::KeyLength)
}

impl Transform for AesCfb128 {
    fn encrypt(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        match &mut self.inner {
            Keyed::Aes128(enc, _) => enc.encrypt(&mut data),
            Keyed::Aes192(enc, _) => enc.encrypt(&mut data),
            Keyed::Aes256(enc, _) => enc.encrypt(&mut data),
        }
        Ok(data)
    }

    fn decrypt(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        match &mut self.inner {
            Keyed::Aes128(_, dec) => dec.decrypt(&mut data),
            Keyed::Aes192(_, dec) => dec.decrypt(&mut data),
            Keyed::Aes256(_, dec) => dec.decrypt(&mut data),
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &[u8]) -> (AesCfb128, AesCfb128) {
        let iv = [7u8; 16];
        (
            AesCfb128::new(key, &iv).unwrap(),
            AesCfb128::new(key, &iv).unwrap(),
        )
    }

    #[test]
    fn key_size_follows_password_length() {
        assert_eq!(pair(b"ABCDEFGHIJKLMNOP").0.key_bits(), 128);
        assert_eq!(pair(b"short").0.key_bits(), 128);
        assert_eq!(pair(b"ABCDEFGHIJKLMNOPQRSTUVWX").0.key_bits(), 192);
        assert_eq!(pair(b"ABCDEFGHIJKLMNOPQ").0.key_bits(), 192);
        assert_eq!(pair(b"ABCDEFGHIJKLMNOPQRSTUVWXYZABCDEF").0.key_bits(), 256);
        assert_eq!(pair(&[1u8; 40]).0.key_bits(), 256);
    }

    #[test]
    fn roundtrip_preserves_length() {
        for key in [&b"ABCDEFGHIJKLMNOP"[..], b"ABCDEFGHIJKLMNOPQRSTUVWX", b"ABCDEFGHIJKLMNOPQRSTUVWXYZABCDEF"] {
            let (mut tx, mut rx) = pair(key);
            for len in [0usize, 1, 5, 15, 16, 17, 33, 1000] {
                let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let cipher = tx.encrypt(plain.clone()).unwrap();
                assert_eq!(cipher.len(), plain.len());
                if len > 0 {
                    assert_ne!(cipher, plain);
                }
                assert_eq!(rx.decrypt(cipher).unwrap(), plain);
            }
        }
    }

    #[test]
    fn keystream_continues_across_unaligned_calls() {
        let (mut whole, _) = pair(b"Ranger");
        let (mut pieces, mut rx) = pair(b"Ranger");
        let plain: Vec<u8> = (0..100u8).collect();

        let expected = whole.encrypt(plain.clone()).unwrap();
        let mut joined = Vec::new();
        for piece in plain.chunks(7) {
            joined.extend(pieces.encrypt(piece.to_vec()).unwrap());
        }
        assert_eq!(joined, expected);

        let mut decrypted = Vec::new();
        for piece in joined.chunks(3) {
            decrypted.extend(rx.decrypt(piece.to_vec()).unwrap());
        }
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn directions_are_independent() {
        let (mut a, mut b) = pair(b"Hello");
        let from_a = a.encrypt(b"ping".to_vec()).unwrap();
        let from_b = b.encrypt(b"pong".to_vec()).unwrap();
        assert_eq!(b.decrypt(from_a).unwrap(), b"ping");
        assert_eq!(a.decrypt(from_b).unwrap(), b"pong");
    }
}
