//! Mumble's OCB2-AES128 datagram encryption.
//!
//! Each datagram is `iv[0] || tag[0..3] || ciphertext`. Both sides keep a
//! 16-byte IV per direction which is incremented for every packet; the receiver
//! reconstructs the full IV from the low byte and its own state.

use std::time::Instant;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4;

type Block = [u8; BLOCK_SIZE];

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DecryptError {
    #[error("datagram too short")]
    TooShort,
    #[error("datagram replayed or too old")]
    Repeat,
    #[error("datagram too late")]
    Late,
    #[error("authentication tag mismatch")]
    Mac,
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct PacketStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
}

pub struct Ocb2 {
    cipher: Aes128,
    encrypt_iv: Block,
    decrypt_iv: Block,
    decrypt_history: [u8; 256],
    stats: PacketStats,
    last_good: Option<Instant>,
}

impl Ocb2 {
    pub fn new(key: [u8; KEY_SIZE], encrypt_iv: Block, decrypt_iv: Block) -> Self {
        Ocb2 {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
            encrypt_iv,
            decrypt_iv,
            decrypt_history: [0; 256],
            stats: PacketStats::default(),
            last_good: None,
        }
    }

    pub fn encrypt_iv(&self) -> Block {
        self.encrypt_iv
    }

    #[cfg(test)]
    pub fn decrypt_iv(&self) -> Block {
        self.decrypt_iv
    }

    pub fn set_decrypt_iv(&mut self, iv: Block) {
        self.decrypt_iv = iv;
    }

    pub fn stats(&self) -> PacketStats {
        self.stats
    }

    pub fn last_good(&self) -> Option<Instant> {
        self.last_good
    }

    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        increment(&mut self.encrypt_iv);

        let mut out = vec![0; HEADER_SIZE + plain.len()];
        let iv = self.encrypt_iv;
        let tag = self.ocb_encrypt(plain, &mut out[HEADER_SIZE..], &iv);

        out[0] = iv[0];
        out[1..HEADER_SIZE].copy_from_slice(&tag[..HEADER_SIZE - 1]);
        out
    }

    pub fn decrypt(&mut self, source: &[u8], now: Instant) -> Result<Vec<u8>, DecryptError> {
        if source.len() < HEADER_SIZE {
            return Err(DecryptError::TooShort);
        }

        let saved_iv = self.decrypt_iv;
        let iv_byte = source[0];
        let mut restore = false;
        let mut late = 0;
        let mut lost = 0;

        if self.decrypt_iv[0].wrapping_add(1) == iv_byte {
            // in order
            if iv_byte > self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv_byte;
                increment(&mut self.decrypt_iv[1..]);
            } else {
                return Err(DecryptError::Repeat);
            }
        } else {
            let current = self.decrypt_iv[0];
            let mut diff = iv_byte as i32 - current as i32;
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if iv_byte < current && diff > -30 && diff < 0 {
                // late, no wraparound
                late = 1;
                self.decrypt_iv[0] = iv_byte;
                restore = true;
            } else if iv_byte > current && diff > -30 && diff < 0 {
                // late, from before the last wraparound
                late = 1;
                self.decrypt_iv[0] = iv_byte;
                decrement(&mut self.decrypt_iv[1..]);
                restore = true;
            } else if iv_byte > current && diff > 0 {
                lost = (iv_byte - current - 1) as u32;
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < current && diff > 0 {
                lost = (256 - current as u32) + iv_byte as u32 - 1;
                self.decrypt_iv[0] = iv_byte;
                increment(&mut self.decrypt_iv[1..]);
            } else {
                return Err(DecryptError::Late);
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = saved_iv;
                return Err(DecryptError::Repeat);
            }
        }

        let iv = self.decrypt_iv;
        let mut plain = vec![0; source.len() - HEADER_SIZE];
        let (tag, ok) = self.ocb_decrypt(&source[HEADER_SIZE..], &mut plain, &iv);

        if !ok || tag[..HEADER_SIZE - 1] != source[1..HEADER_SIZE] {
            self.decrypt_iv = saved_iv;
            return Err(DecryptError::Mac);
        }

        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if restore {
            self.decrypt_iv = saved_iv;
        }

        self.stats.good = self.stats.good.wrapping_add(1);
        self.stats.late = self.stats.late.wrapping_add(late);
        self.stats.lost = self.stats.lost.wrapping_add(lost);
        self.last_good = Some(now);

        Ok(plain)
    }

    fn aes_encrypt(&self, block: &Block) -> Block {
        let mut b = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut b);
        to_block(&b)
    }

    fn aes_decrypt(&self, block: &Block) -> Block {
        let mut b = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut b);
        to_block(&b)
    }

    fn ocb_encrypt(&self, plain: &[u8], encrypted: &mut [u8], nonce: &Block) -> Block {
        let mut delta = self.aes_encrypt(nonce);
        let mut checksum = [0; BLOCK_SIZE];

        let mut remaining = plain.len();
        let mut offset = 0;

        while remaining > BLOCK_SIZE {
            let block: Block = to_block(&plain[offset..offset + BLOCK_SIZE]);

            // XEX* countermeasure (eprint 2019/311, section 9): the second to
            // last block must not be all zero except for the last byte.
            let flip = remaining - BLOCK_SIZE <= BLOCK_SIZE
                && block[..BLOCK_SIZE - 1].iter().all(|&b| b == 0);

            s2(&mut delta);
            let mut tmp = xor(&delta, &block);
            if flip {
                tmp[0] ^= 1;
            }
            let tmp = self.aes_encrypt(&tmp);
            encrypted[offset..offset + BLOCK_SIZE].copy_from_slice(&xor(&delta, &tmp));

            checksum = xor(&checksum, &block);
            if flip {
                checksum[0] ^= 1;
            }

            remaining -= BLOCK_SIZE;
            offset += BLOCK_SIZE;
        }

        s2(&mut delta);
        let pad = self.aes_encrypt(&xor(&delta, &length_block(remaining)));

        let mut tmp = pad;
        tmp[..remaining].copy_from_slice(&plain[offset..]);
        checksum = xor(&checksum, &tmp);
        let tmp = xor(&pad, &tmp);
        encrypted[offset..].copy_from_slice(&tmp[..remaining]);

        s3(&mut delta);
        self.aes_encrypt(&xor(&delta, &checksum))
    }

    fn ocb_decrypt(&self, encrypted: &[u8], plain: &mut [u8], nonce: &Block) -> (Block, bool) {
        let mut delta = self.aes_encrypt(nonce);
        let mut checksum = [0; BLOCK_SIZE];
        let mut ok = true;

        let mut remaining = encrypted.len();
        let mut offset = 0;

        while remaining > BLOCK_SIZE {
            let block: Block = to_block(&encrypted[offset..offset + BLOCK_SIZE]);

            s2(&mut delta);
            let tmp = self.aes_decrypt(&xor(&delta, &block));
            let p = xor(&delta, &tmp);
            plain[offset..offset + BLOCK_SIZE].copy_from_slice(&p);
            checksum = xor(&checksum, &p);

            remaining -= BLOCK_SIZE;
            offset += BLOCK_SIZE;
        }

        s2(&mut delta);
        let pad = self.aes_encrypt(&xor(&delta, &length_block(remaining)));

        let mut tmp = [0; BLOCK_SIZE];
        tmp[..remaining].copy_from_slice(&encrypted[offset..]);
        let tmp = xor(&tmp, &pad);
        checksum = xor(&checksum, &tmp);
        plain[offset..].copy_from_slice(&tmp[..remaining]);

        // XEX* countermeasure: a forged final block would decrypt to delta.
        if tmp[..BLOCK_SIZE - 1] == delta[..BLOCK_SIZE - 1] {
            ok = false;
        }

        s3(&mut delta);
        (self.aes_encrypt(&xor(&delta, &checksum)), ok)
    }
}

fn to_block(slice: &[u8]) -> Block {
    let mut b = [0; BLOCK_SIZE];
    b.copy_from_slice(slice);
    b
}

fn length_block(len: usize) -> Block {
    let mut b = [0; BLOCK_SIZE];
    b[8..].copy_from_slice(&((len * 8) as u64).to_be_bytes());
    b
}

fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Doubling in GF(2^128), big endian.
fn s2(block: &mut Block) {
    let carry = block[0] >> 7;
    for i in 0..BLOCK_SIZE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK_SIZE - 1] = (block[BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
}

fn s3(block: &mut Block) {
    let orig = *block;
    s2(block);
    *block = xor(block, &orig);
}

fn increment(iv: &mut [u8]) {
    for b in iv.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

fn decrement(iv: &mut [u8]) {
    for b in iv.iter_mut() {
        let old = *b;
        *b = b.wrapping_sub(1);
        if old != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Ocb2, Ocb2) {
        let key = [7; KEY_SIZE];
        let client_iv = [1; BLOCK_SIZE];
        let server_iv = [2; BLOCK_SIZE];

        (
            Ocb2::new(key, client_iv, server_iv),
            Ocb2::new(key, server_iv, client_iv),
        )
    }

    #[test]
    fn round_trip_various_lengths() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        for len in [0, 1, 15, 16, 17, 31, 32, 33, 100] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let enc = client.encrypt(&plain);
            assert_eq!(enc.len(), plain.len() + HEADER_SIZE);
            assert_eq!(server.decrypt(&enc, now).unwrap(), plain);
        }

        assert_eq!(server.stats().good, 9);
        assert_eq!(server.stats().lost, 0);
    }

    #[test]
    fn tampering_detected() {
        let (mut client, mut server) = pair();
        let mut enc = client.encrypt(b"hello there, general");
        enc[10] ^= 0x40;

        let before = server.decrypt_iv();
        assert_eq!(server.decrypt(&enc, Instant::now()), Err(DecryptError::Mac));
        assert_eq!(server.decrypt_iv(), before);
    }

    #[test]
    fn replay_rejected() {
        let (mut client, mut server) = pair();
        let now = Instant::now();
        let first = client.encrypt(b"one");
        let second = client.encrypt(b"two");

        server.decrypt(&first, now).unwrap();
        server.decrypt(&second, now).unwrap();
        assert!(server.decrypt(&first, now).is_err());
    }

    #[test]
    fn lost_and_late_counted() {
        let (mut client, mut server) = pair();
        let now = Instant::now();
        let a = client.encrypt(b"a");
        let b = client.encrypt(b"b");
        let c = client.encrypt(b"c");

        server.decrypt(&a, now).unwrap();
        server.decrypt(&c, now).unwrap();
        assert_eq!(server.stats().lost, 1);

        assert_eq!(server.decrypt(&b, now).unwrap(), b"b");
        assert_eq!(server.stats().late, 1);
        assert_eq!(server.stats().good, 3);
    }

    #[test]
    fn iv_wraps_into_higher_bytes() {
        let key = [3; KEY_SIZE];
        let mut iv = [0; BLOCK_SIZE];
        iv[0] = 0xfe;
        let mut client = Ocb2::new(key, iv, iv);
        let mut server = Ocb2::new(key, iv, iv);
        let now = Instant::now();

        for i in 0..4u8 {
            let enc = client.encrypt(&[i]);
            assert_eq!(server.decrypt(&enc, now).unwrap(), vec![i]);
        }

        assert_eq!(client.encrypt_iv()[1], 1);
        assert_eq!(server.decrypt_iv()[1], 1);
    }

    #[test]
    fn doubling_reduces_with_polynomial() {
        let mut b = [0; BLOCK_SIZE];
        b[0] = 0x80;
        s2(&mut b);
        let mut expected = [0; BLOCK_SIZE];
        expected[BLOCK_SIZE - 1] = 0x87;
        assert_eq!(b, expected);
    }
}
