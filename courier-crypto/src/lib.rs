//! Cryptography for the courier MTProto stack.
//!
//! Provides:
//! - AES-256-IGE (see [`aes`])
//! - MTProto 2.0 packet encryption for either side of the connection
//! - `AuthKey`, the 256-byte key produced by the DH exchange
//! - Pollard-rho PQ factorization and the RSA-PAD scheme
//! - DH parameter validation (see [`dh`])
//! - The Obfuscated2 stream cipher (see [`obfuscated`])

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
pub mod dh;
mod factorize;
pub mod obfuscated;
pub mod rsa;

pub use auth_key::AuthKey;
pub use factorize::factorize;

/// SHA-1 of one or more byte slices concatenated.
#[macro_export]
macro_rules! sha1 {
    ( $( $x:expr ),+ ) => {{
        use sha1::{Digest, Sha1};
        let mut h = Sha1::new();
        $( h.update($x); )+
        let out: [u8; 20] = h.finalize().into();
        out
    }};
}

/// SHA-256 of one or more byte slices concatenated.
#[macro_export]
macro_rules! sha256 {
    ( $( $x:expr ),+ ) => {{
        use sha2::{Digest, Sha256};
        let mut h = Sha256::new();
        $( h.update($x); )+
        let out: [u8; 32] = h.finalize().into();
        out
    }};
}

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// The party that produced a packet. Selects the `x` offset into the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Packets sent by the client.
    Client,
    /// Packets sent by the server.
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

fn msg_key_for(auth_key: &AuthKey, plaintext: &[u8], side: Side) -> [u8; 16] {
    let x = side.x();
    let large = sha256!(&auth_key.data[88 + x..88 + x + 32], plaintext);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&large[8..24]);
    msg_key
}

// 12..1024 random bytes are required; this yields 17..32 and block alignment.
fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt `plaintext` as `side` using MTProto 2.0.
///
/// Returns `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Result<Vec<u8>, getrandom::Error> {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd)?;
    Ok(do_encrypt_data_v2(plaintext, auth_key, side, &rnd))
}

fn do_encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side, rnd: &[u8; 32]) -> Vec<u8> {
    let pad = padding_len(plaintext.len());
    let mut body = Vec::with_capacity(plaintext.len() + pad);
    body.extend_from_slice(plaintext);
    body.extend_from_slice(&rnd[..pad]);

    let msg_key = msg_key_for(auth_key, &body, side);
    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut body, &key, &iv);

    let mut out = Vec::with_capacity(24 + body.len());
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(&body);
    out
}

/// Decrypt a packet that was produced by `side`.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`; on success the
/// returned slice of `buffer` holds the plaintext (padding included).
pub fn decrypt_data_v2<'a>(buffer: &'a mut [u8], auth_key: &AuthKey, side: Side) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    if msg_key != msg_key_for(auth_key, &buffer[24..], side) {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Derive `(key, iv)` for the `server_DH_params_ok.encrypted_answer` exchange.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn server_reads_what_client_wrote() {
        let key = test_key();
        let plain = b"0123456789abcdef0123456789abcdef".to_vec();
        let mut wire = do_encrypt_data_v2(&plain, &key, Side::Client, &[7; 32]);

        assert_eq!(&wire[..8], &key.key_id());
        assert_eq!((wire.len() - 24) % 16, 0);

        let out = decrypt_data_v2(&mut wire, &key, Side::Client).unwrap();
        assert_eq!(&out[..plain.len()], &plain[..]);
    }

    #[test]
    fn wrong_side_fails_msg_key_check() {
        let key = test_key();
        let mut wire = do_encrypt_data_v2(b"hello, world", &key, Side::Client, &[1; 32]);
        assert_eq!(
            decrypt_data_v2(&mut wire, &key, Side::Server),
            Err(DecryptError::MessageKeyMismatch)
        );
    }

    #[test]
    fn foreign_key_id_is_rejected() {
        let key = test_key();
        let other = AuthKey::from_bytes([9; 256]);
        let mut wire = do_encrypt_data_v2(b"abc", &key, Side::Server, &[0; 32]);
        assert_eq!(decrypt_data_v2(&mut wire, &other, Side::Server), Err(DecryptError::AuthKeyMismatch));
    }

    #[test]
    fn misaligned_buffer_is_rejected() {
        let key = test_key();
        let mut wire = vec![0u8; 30];
        assert_eq!(decrypt_data_v2(&mut wire, &key, Side::Server), Err(DecryptError::InvalidBuffer));
    }
}
