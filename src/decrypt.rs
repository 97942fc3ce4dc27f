//! AES-128-CBC/PKCS7 decryption primitive (§6). Consumed by the HLS path of the runner
//! once a segment has been fetched to disk.

use aes::Aes128;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::error::DecryptError;

type Aes128CbcDec = Decryptor<Aes128>;

/// Derive the fallback IV from a segment's media sequence number when the task carries no
/// explicit `iv`: a 16-byte big-endian encoding of the index, zero-padded in the high bytes.
pub fn iv_from_segment_index(index: usize) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&(index as u64).to_be_bytes());
    iv
}

fn parse_key(key: &str) -> Result<[u8; 16], DecryptError> {
    let bytes = if let Some(hex_str) = key.strip_prefix("0x") {
        hex::decode(hex_str).map_err(|e| DecryptError::InvalidKey(e.to_string()))?
    } else if key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(key).map_err(|e| DecryptError::InvalidKey(e.to_string()))?
    } else {
        key.as_bytes().to_vec()
    };
    if bytes.len() != 16 {
        return Err(DecryptError::InvalidKey(format!(
            "expected a 16-byte AES-128 key, got {} bytes",
            bytes.len()
        )));
    }
    let mut key16 = [0u8; 16];
    key16.copy_from_slice(&bytes);
    Ok(key16)
}

fn parse_iv(iv: &str) -> Result<[u8; 16], DecryptError> {
    let hex_str = iv.strip_prefix("0x").unwrap_or(iv);
    let bytes = hex::decode(hex_str).map_err(|e| DecryptError::InvalidKey(e.to_string()))?;
    if bytes.len() != 16 {
        return Err(DecryptError::InvalidKey(format!(
            "expected a 16-byte IV, got {} bytes",
            bytes.len()
        )));
    }
    let mut iv16 = [0u8; 16];
    iv16.copy_from_slice(&bytes);
    Ok(iv16)
}

/// Decrypts `ciphertext` in place (AES-128-CBC, PKCS#7 padding removed) and returns the
/// plaintext. Pure, synchronous, CPU-bound — callers run it on a blocking-safe context.
pub fn decrypt_bytes(mut ciphertext: Vec<u8>, key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>, DecryptError> {
    let decryptor = Aes128CbcDec::new(key.into(), iv.into());
    let plaintext_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
        .map_err(|_| DecryptError::Padding)?
        .len();
    ciphertext.truncate(plaintext_len);
    Ok(ciphertext)
}

/// Decrypts the file at `path` in place. `key` and `iv` are as supplied on the `Task`
/// (`iv` falls back to the segment-index-derived value when absent, per §6/§9). Runs on a
/// `spawn_blocking` worker so the orchestration loop is never blocked by the cipher pass.
pub async fn decrypt_file_in_place(
    path: std::path::PathBuf,
    key: String,
    iv: Option<String>,
    segment_index: usize,
) -> Result<(), DecryptError> {
    tokio::task::spawn_blocking(move || {
        let key_bytes = parse_key(&key)?;
        let iv_bytes = match iv {
            Some(iv) => parse_iv(&iv)?,
            None => iv_from_segment_index(segment_index),
        };
        let ciphertext = std::fs::read(&path)?;
        let plaintext = decrypt_bytes(ciphertext, &key_bytes, &iv_bytes)?;
        std::fs::write(&path, plaintext)?;
        Ok(())
    })
    .await
    .map_err(|e| DecryptError::Io(std::io::Error::other(e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::Encryptor;
    use cipher::BlockEncryptMut;

    type Aes128CbcEnc = Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let encryptor = Aes128CbcEnc::new(key.into(), iv.into());
        encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    #[test]
    fn round_trips_with_explicit_iv() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let ciphertext = encrypt(&plaintext, &key, &iv);
        let decrypted = decrypt_bytes(ciphertext, &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn iv_from_segment_index_is_big_endian_zero_padded() {
        let iv = iv_from_segment_index(5);
        assert_eq!(&iv[..8], &[0u8; 8]);
        assert_eq!(iv[15], 5);
    }

    #[test]
    fn parse_key_accepts_hex_and_raw() {
        let raw = parse_key("0123456789abcdef").unwrap();
        assert_eq!(raw, *b"0123456789abcdef");
        let hex = parse_key("0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(hex[0], 0x00);
        assert_eq!(hex[15], 0x0f);
    }

    #[tokio::test]
    async fn decrypt_file_in_place_round_trips() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let plaintext = b"segment payload bytes".to_vec();
        let ciphertext = encrypt(&plaintext, &key, &iv);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_0.ts");
        std::fs::write(&path, &ciphertext).unwrap();

        decrypt_file_in_place(
            path.clone(),
            hex::encode(key),
            Some(format!("0x{}", hex::encode(iv))),
            0,
        )
        .await
        .unwrap();

        let result = std::fs::read(&path).unwrap();
        assert_eq!(result, plaintext);
    }
}
