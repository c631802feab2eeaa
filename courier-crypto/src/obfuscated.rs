//! Obfuscated2 transport cipher.
//!
//! The client opens with 64 random bytes whose bytes `56..60` carry the
//! framing tag. Both directions then run AES-256-CTR keyed from that nonce:
//! the client-to-server key is `nonce[8..40]` with IV `nonce[40..56]`, the
//! reverse direction uses the same 48 bytes reversed. With a proxy secret
//! each key becomes `SHA256(key || secret)`.
//!
//! [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation

use ::aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::sha256;

type Ctr = ctr::Ctr128BE<Aes256>;

/// Paired encrypt / decrypt keystreams for one obfuscated connection.
pub struct ObfuscatedCipher {
    tx: Ctr,
    rx: Ctr,
}

impl ObfuscatedCipher {
    /// Build the cipher pair and the 64-byte header to send first.
    ///
    /// `tag` is the four-byte framing marker (`0xefefefef`, `0xeeeeeeee`
    /// or `0xdddddddd`).
    pub fn new(tag: [u8; 4], secret: Option<&[u8; 16]>) -> Result<(Self, [u8; 64]), getrandom::Error> {
        let nonce = loop {
            let mut nonce = [0u8; 64];
            getrandom::getrandom(&mut nonce)?;
            if nonce_is_usable(&nonce) {
                break nonce;
            }
        };
        Ok(Self::from_nonce(nonce, tag, secret))
    }

    /// Deterministic variant of [`ObfuscatedCipher::new`].
    pub fn from_nonce(mut nonce: [u8; 64], tag: [u8; 4], secret: Option<&[u8; 16]>) -> (Self, [u8; 64]) {
        nonce[56..60].copy_from_slice(&tag);

        let mut reversed = [0u8; 48];
        reversed.copy_from_slice(&nonce[8..56]);
        reversed.reverse();

        let tx = build(&nonce[8..40], &nonce[40..56], secret);
        let rx = build(&reversed[..32], &reversed[32..], secret);
        let mut cipher = Self { tx, rx };

        let mut encrypted = nonce;
        cipher.tx.apply_keystream(&mut encrypted);

        let mut header = nonce;
        header[56..].copy_from_slice(&encrypted[56..]);
        (cipher, header)
    }

    /// Encrypt outgoing bytes in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.tx.apply_keystream(data);
    }

    /// Decrypt incoming bytes in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.rx.apply_keystream(data);
    }
}

fn build(key_src: &[u8], iv: &[u8], secret: Option<&[u8; 16]>) -> Ctr {
    let mut key = [0u8; 32];
    match secret {
        Some(s) => key = sha256!(key_src, s),
        None => key.copy_from_slice(key_src),
    }
    Ctr::new(GenericArray::from_slice(&key), GenericArray::from_slice(iv))
}

// Values a middlebox could confuse with another protocol.
fn nonce_is_usable(nonce: &[u8; 64]) -> bool {
    let head = [nonce[0], nonce[1], nonce[2], nonce[3]];
    nonce[0] != 0xef
        && !matches!(
            &head,
            b"HEAD" | b"POST" | b"GET " | b"OPTI" | [0xdd, 0xdd, 0xdd, 0xdd] | [0xee, 0xee, 0xee, 0xee] | [0x16, 0x03, 0x01, 0x02]
        )
        && nonce[4..8] != [0, 0, 0, 0]
}
