//! Cryptographic primitives for FVP
//!
//! ChaCha20-Poly1305 authenticated encryption with a nonce derived from the
//! packet sequence number, plus key-material helpers (generation, hex
//! encoding, fingerprints).

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key as CipherKey, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Tunnel keys are exactly 32 bytes.
pub const KEY_LEN: usize = 32;
/// Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;
/// AEAD nonce size.
pub const NONCE_LEN: usize = 12;

/// A 32-byte pre-shared or server-generated tunnel key.
pub type Key = [u8; KEY_LEN];

/// Generate a fresh key from the operating system RNG.
pub fn generate_key() -> Key {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Build the 12-byte nonce for a sequence number: the sequence in
/// little-endian in bytes 0..4, zeros elsewhere. Nonce uniqueness therefore
/// rests entirely on the per-peer sequence discipline in the peer table.
pub fn nonce_from_sequence(sequence: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Encrypt a payload under `key` with the nonce for `sequence`. Returns
/// ciphertext with the 16-byte tag appended.
pub fn seal(plaintext: &[u8], key: &Key, sequence: u32) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    let nonce = nonce_from_sequence(sequence);
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Undecryptable)
}

/// Decrypt a sealed payload. Every failure mode (truncated input, corrupt
/// tag, wrong key, wrong sequence) collapses to the same error so the
/// datapath cannot become a decryption oracle.
pub fn open(ciphertext: &[u8], key: &Key, sequence: u32) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    let nonce = nonce_from_sequence(sequence);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| Error::Undecryptable)
}

/// Strictly decode a 64-character hex key.
pub fn decode_key_hex(s: &str) -> Result<Key> {
    let bytes = hex::decode(s).map_err(|_| Error::InvalidHexKey(s.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::InvalidKeyLength(bytes.len()));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Hex-encode a key for configuration and CLI output.
pub fn encode_key_hex(key: &Key) -> String {
    hex::encode(key)
}

/// Short SHA-256 fingerprint used to index live peers by key.
pub fn fingerprint(key: &Key) -> [u8; 8] {
    let digest = Sha256::digest(key);
    let mut fp = [0u8; 8];
    fp.copy_from_slice(&digest[..8]);
    fp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_sequence_le_then_zeros() {
        let nonce = nonce_from_sequence(0x01020304);
        assert_eq!(&nonce[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&nonce[4..], &[0u8; 8]);
        assert_eq!(nonce_from_sequence(0), [0u8; NONCE_LEN]);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = generate_key();
        for sequence in [0u32, 1, 77, u32::MAX] {
            let plaintext = b"a raw ip datagram";
            let sealed = seal(plaintext, &key, sequence).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);
            assert_eq!(open(&sealed, &key, sequence).unwrap(), plaintext);
        }
    }

    #[test]
    fn open_rejects_wrong_key() {
        let key = generate_key();
        let sealed = seal(b"secret", &key, 5).unwrap();
        let other = generate_key();
        assert!(matches!(open(&sealed, &other, 5), Err(Error::Undecryptable)));
    }

    #[test]
    fn open_rejects_wrong_sequence() {
        let key = generate_key();
        let sealed = seal(b"secret", &key, 5).unwrap();
        assert!(matches!(open(&sealed, &key, 6), Err(Error::Undecryptable)));
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = generate_key();
        let mut sealed = seal(b"secret", &key, 5).unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(open(&sealed, &key, 5), Err(Error::Undecryptable)));
        assert!(matches!(open(&[], &key, 5), Err(Error::Undecryptable)));
    }

    #[test]
    fn hex_key_round_trip() {
        let key = generate_key();
        let encoded = encode_key_hex(&key);
        assert_eq!(encoded.len(), 64);
        assert_eq!(decode_key_hex(&encoded).unwrap(), key);
    }

    #[test]
    fn hex_key_strict_validation() {
        assert!(matches!(decode_key_hex("zz"), Err(Error::InvalidHexKey(_))));
        assert!(matches!(
            decode_key_hex(&"ab".repeat(16)),
            Err(Error::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn fingerprints_distinguish_keys() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
