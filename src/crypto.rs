//! Tuya protocol encryption and signing.
//! AES-128-ECB with PKCS#7 padding (v3.1, v3.3) and the MD5 payload signature of v3.1.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};

const BLOCK_SIZE: usize = 16;

/// TuyaCipher provides AES-128-ECB encryption and decryption keyed by the local key.
#[derive(Clone)]
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
}

impl std::fmt::Debug for TuyaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuyaCipher").finish_non_exhaustive()
    }
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::InvalidConfig(format!(
                "local key must be 16 bytes, got {}",
                key.len()
            )));
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt data with PKCS#7 padding.
    /// * `use_base64`: If true, encode the result in Base64.
    pub fn encrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        let padding_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        let mut ciphertext = Vec::with_capacity(data.len() + padding_len);
        ciphertext.extend_from_slice(data);
        ciphertext.resize(data.len() + padding_len, padding_len as u8);

        for chunk in ciphertext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        if use_base64 {
            Ok(general_purpose::STANDARD.encode(&ciphertext).into_bytes())
        } else {
            Ok(ciphertext)
        }
    }

    /// Decrypt data and strip PKCS#7 padding.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    pub fn decrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut plaintext = if use_base64 {
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if plaintext.is_empty() || !plaintext.len().is_multiple_of(BLOCK_SIZE) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in plaintext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK_SIZE {
            return Err(TuyaError::DecryptionFailed);
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(TuyaError::DecryptionFailed);
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }

    /// v3.1 payload signature: the middle 16 hex digits of
    /// `md5("data=" + b64 + "||lpv=" + version + "||" + local_key)`.
    pub fn signature(&self, b64_payload: &[u8], version: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(b64_payload);
        hasher.update(b"||lpv=");
        hasher.update(version);
        hasher.update(b"||");
        hasher.update(self.key);
        let digest = hex::encode(hasher.finalize());

        let mut sig = [0u8; 16];
        sig.copy_from_slice(&digest.as_bytes()[8..24]);
        sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    #[test]
    fn test_encrypt_pads_to_block_size() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        assert_eq!(cipher.encrypt(b"{}", false).unwrap().len(), 16);
        // A full block still gets a padding block.
        assert_eq!(cipher.encrypt(&[b'a'; 16], false).unwrap().len(), 32);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let other = TuyaCipher::new(b"fedcba9876543210").unwrap();
        let encrypted = cipher.encrypt(br#"{"dps":{"1":true}}"#, false).unwrap();

        assert_eq!(
            cipher.decrypt(&encrypted, false).unwrap(),
            br#"{"dps":{"1":true}}"#
        );
        // Padding check rejects garbage plaintext.
        assert!(other.decrypt(&encrypted, false).is_err());
    }

    #[test]
    fn test_base64_mode() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let encrypted = cipher.encrypt(b"hello", true).unwrap();
        assert!(encrypted.iter().all(|b| b.is_ascii()));
        assert_eq!(cipher.decrypt(&encrypted, true).unwrap(), b"hello");
        assert_eq!(
            cipher.decrypt(b"not base64!", true),
            Err(TuyaError::DecryptionFailed)
        );
    }

    #[test]
    fn test_key_length_validated() {
        assert!(matches!(
            TuyaCipher::new(b"short"),
            Err(TuyaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_signature_is_hex_and_key_dependent() {
        let a = TuyaCipher::new(KEY).unwrap();
        let b = TuyaCipher::new(b"fedcba9876543210").unwrap();
        let sig = a.signature(b"abcd", b"3.1");
        assert!(sig.iter().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sig, b.signature(b"abcd", b"3.1"));
        assert_eq!(sig, a.signature(b"abcd", b"3.1"));
    }
}
