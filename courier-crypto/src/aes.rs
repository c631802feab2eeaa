//! AES-256 in Infinite Garble Extension (IGE) mode.
//!
//! The 32-byte IV is split into `iv1` (previous ciphertext block) and `iv2`
//! (previous plaintext block). Buffers must be a multiple of 16 bytes.

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

type Block = ::aes::Block;

fn xor16(a: &[u8], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
    out
}

fn split_iv(iv: &[u8; 32]) -> ([u8; 16], [u8; 16]) {
    let mut a = [0u8; 16];
    let mut b = [0u8; 16];
    a.copy_from_slice(&iv[..16]);
    b.copy_from_slice(&iv[16..]);
    (a, b)
}

/// Encrypt `buffer` in place.
///
/// # Panics
/// If `buffer.len()` is not a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % 16, 0, "IGE input must be block aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_c, mut prev_p) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut p = [0u8; 16];
        p.copy_from_slice(chunk);

        let mut block = Block::clone_from_slice(&xor16(&p, &prev_c));
        cipher.encrypt_block(&mut block);
        let c = xor16(&block, &prev_p);

        chunk.copy_from_slice(&c);
        prev_c = c;
        prev_p = p;
    }
}

/// Decrypt `buffer` in place.
///
/// # Panics
/// If `buffer.len()` is not a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % 16, 0, "IGE input must be block aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_c, mut prev_p) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut c = [0u8; 16];
        c.copy_from_slice(chunk);

        let mut block = Block::clone_from_slice(&xor16(&c, &prev_p));
        cipher.decrypt_block(&mut block);
        let p = xor16(&block, &prev_c);

        chunk.copy_from_slice(&p);
        prev_c = c;
        prev_p = p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> ([u8; 32], [u8; 32], [u8; 32]) {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 32];
        let mut plain = [0u8; 32];
        for i in 0..32 {
            key[i] = i as u8;
            iv[i] = 32 + i as u8;
            plain[i] = 64 + i as u8;
        }
        (key, iv, plain)
    }

    #[test]
    fn encrypt_known_answer() {
        let (key, iv, mut data) = fixture();
        ige_encrypt(&mut data, &key, &iv);
        let expected: [u8; 32] = [
            0xb6, 0xb2, 0x3c, 0xb4, 0x6d, 0x2f, 0x43, 0xde, 0x2c, 0x67, 0xfc, 0x9a, 0x3a, 0x9e, 0x35, 0x10,
            0x4f, 0xad, 0x6e, 0xd1, 0x51, 0x77, 0x96, 0x9c, 0x1c, 0xeb, 0xc6, 0x16, 0xbc, 0xfa, 0x48, 0x2c,
        ];
        assert_eq!(data, expected);
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let (key, iv, plain) = fixture();
        let mut data = plain;
        ige_encrypt(&mut data, &key, &iv);
        ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, plain);
    }
}
