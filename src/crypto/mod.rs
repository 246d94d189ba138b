//! Per-object encryption.
//!
//! Every object is encrypted with a key derived from the shared passphrase
//! and a salt of `bucket + "/" + object-key`, so no two distinct objects
//! ever reuse a key/salt pair even under a single passphrase.
//!
//! Ciphertext is framed in a DARE-style chunked format: plaintext is split
//! into 64 KiB blocks, each carried with exactly 32 bytes of overhead:
//! a 16-byte header authenticated as AAD plus a 16-byte Poly1305 tag.
//! [`encrypted_size`] and [`decrypted_size`] invert this chunking exactly;
//! a ciphertext remainder at or below the overhead size is a corruption
//! error, never a valid payload.

use crate::utils::{HashtreeError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Plaintext bytes per encrypted block.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Fixed per-block overhead: 16-byte header + 16-byte authentication tag.
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + TAG_SIZE;

const HEADER_SIZE: usize = 16;
const TAG_SIZE: usize = 16;

const FORMAT_VERSION: u8 = 1;
const FLAG_FINAL: u8 = 0b0000_0001;

/// Argon2id parameters: 1 iteration, 64 MiB memory, 4 lanes, 32-byte key.
const KDF_TIME_COST: u32 = 1;
const KDF_MEMORY_KIB: u32 = 64 * 1024;
const KDF_LANES: u32 = 4;
const KEY_SIZE: usize = 32;

/// Derive the symmetric key for one object.
///
/// Memory-hard; callers on the async runtime should wrap this in
/// `spawn_blocking`.
pub fn derive_key(passphrase: &str, bucket: &str, object_key: &str) -> Result<[u8; KEY_SIZE]> {
    let salt = format!("{bucket}/{object_key}");
    let params = Params::new(KDF_MEMORY_KIB, KDF_TIME_COST, KDF_LANES, Some(KEY_SIZE))
        .map_err(|e| HashtreeError::Crypto(format!("invalid KDF parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon
        .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key)
        .map_err(|e| HashtreeError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Ciphertext size for a given plaintext size. An encrypted object is
/// always larger than a plain object except for zero-size objects.
pub fn encrypted_size(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    let overhead = BLOCK_OVERHEAD as u64;

    let mut ssize = (size / block) * (block + overhead);
    let rem = size % block;
    if rem > 0 {
        ssize += rem + overhead;
    }
    ssize
}

/// Plaintext size recovered from a ciphertext size, inverting the chunking.
///
/// A trailing partial block must still carry its full overhead; a remainder
/// at or below the overhead size means the object was tampered with.
pub fn decrypted_size(encrypted: u64) -> Result<u64> {
    if encrypted == 0 {
        return Ok(0);
    }
    let packaged = (BLOCK_SIZE + BLOCK_OVERHEAD) as u64;
    let overhead = BLOCK_OVERHEAD as u64;

    let mut size = (encrypted / packaged) * BLOCK_SIZE as u64;
    let rem = encrypted % packaged;
    if rem > 0 {
        if rem < overhead + 1 {
            return Err(HashtreeError::TamperedObject);
        }
        size += rem - overhead;
    }
    Ok(size)
}

/// Read until the buffer is full or EOF; returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn nonce_from_header(header: &[u8; HEADER_SIZE]) -> [u8; 12] {
    // 8 random bytes chosen per stream, followed by the block sequence
    // number. Keys are unique per object, sequence numbers per block.
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&header[8..16]);
    nonce[8..].copy_from_slice(&header[4..8]);
    nonce
}

fn seal_block(
    cipher: &ChaCha20Poly1305,
    nonce_half: &[u8; 8],
    seq: u32,
    plaintext: &[u8],
    is_final: bool,
) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1] = if is_final { FLAG_FINAL } else { 0 };
    // 0 denotes a full 64 KiB block (the length does not fit in u16).
    let len_field: u16 = if plaintext.len() == BLOCK_SIZE {
        0
    } else {
        plaintext.len() as u16
    };
    header[2..4].copy_from_slice(&len_field.to_be_bytes());
    header[4..8].copy_from_slice(&seq.to_be_bytes());
    header[8..16].copy_from_slice(nonce_half);

    let nonce = nonce_from_header(&header);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|_| HashtreeError::Crypto("block encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + sealed.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Encrypt a plaintext stream into the chunked format.
///
/// Streams block by block with one block of lookahead (to mark the final
/// block), never buffering the whole input. Empty plaintext produces an
/// empty ciphertext. Returns the number of ciphertext bytes written.
pub async fn encrypt_stream<R, W>(key: &[u8; KEY_SIZE], mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_half = [0u8; 8];
    OsRng.fill_bytes(&mut nonce_half);

    let mut current = vec![0u8; BLOCK_SIZE];
    let mut next = vec![0u8; BLOCK_SIZE];
    let mut written = 0u64;
    let mut seq: u32 = 0;

    let mut current_len = read_full(&mut src, &mut current).await?;
    if current_len == 0 {
        dst.flush().await?;
        return Ok(0);
    }

    loop {
        // A short block means EOF was already reached; a full block needs
        // one block of lookahead to know whether it is the last.
        let (is_final, next_len) = if current_len < BLOCK_SIZE {
            (true, 0)
        } else {
            let n = read_full(&mut src, &mut next).await?;
            (n == 0, n)
        };

        let frame = seal_block(&cipher, &nonce_half, seq, &current[..current_len], is_final)?;
        dst.write_all(&frame).await?;
        written += frame.len() as u64;

        if is_final {
            break;
        }
        seq = seq
            .checked_add(1)
            .ok_or_else(|| HashtreeError::Crypto("object exceeds block sequence space".to_string()))?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    dst.flush().await?;
    Ok(written)
}

/// Decrypt a chunked-format stream back into plaintext.
///
/// Verifies the format version, per-block authentication, the block
/// sequence, and that the stream ends exactly at a final-flagged block.
/// Returns the number of plaintext bytes written.
pub async fn decrypt_stream<R, W>(key: &[u8; KEY_SIZE], mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut header = [0u8; HEADER_SIZE];
    let mut expected_seq: u32 = 0;
    let mut total = 0u64;
    let mut saw_final = false;

    loop {
        let n = read_full(&mut src, &mut header).await?;
        if n == 0 {
            break;
        }
        if n < HEADER_SIZE || saw_final {
            // Torn header, or trailing data after the final block.
            return Err(HashtreeError::TamperedObject);
        }
        if header[0] != FORMAT_VERSION {
            return Err(HashtreeError::Crypto(format!(
                "unsupported encryption format version {}",
                header[0]
            )));
        }

        let len_field = u16::from_be_bytes([header[2], header[3]]);
        let payload_len = if len_field == 0 {
            BLOCK_SIZE
        } else {
            len_field as usize
        };
        let seq = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if seq != expected_seq {
            return Err(HashtreeError::Crypto(format!(
                "block {seq} out of order (expected {expected_seq})"
            )));
        }

        let mut sealed = vec![0u8; payload_len + TAG_SIZE];
        let n = read_full(&mut src, &mut sealed).await?;
        if n < sealed.len() {
            return Err(HashtreeError::TamperedObject);
        }

        let nonce = nonce_from_header(&header);
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &header,
                },
            )
            .map_err(|_| {
                HashtreeError::Crypto(
                    "authenticated decryption failed (wrong passphrase or corrupted ciphertext)"
                        .to_string(),
                )
            })?;

        dst.write_all(&plain).await?;
        total += plain.len() as u64;
        saw_final = header[1] & FLAG_FINAL != 0;
        expected_seq = expected_seq.wrapping_add(1);
    }

    if total > 0 && !saw_final {
        // Whole trailing blocks were cut off.
        return Err(HashtreeError::TamperedObject);
    }
    dst.flush().await?;
    Ok(total)
}
