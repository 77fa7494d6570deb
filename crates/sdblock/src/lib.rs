//! Self-synchronising durable block container.
//!
//! A block is the unit of durable storage: a soft-matched magic prefix, a
//! Reed-Solomon protected big-endian payload length, a Reed-Solomon protected
//! big-endian XXH32 payload digest, and a MessagePack payload. Scanning a
//! byte stream re-synchronises past truncation, bit rot, and interleaved
//! junk: damaged headers are skipped, payloads failing the digest are
//! skipped, and a block extending past the end of the buffer is reported as
//! truncated rather than decoded.

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh32::xxh32;

pub mod rs;

/// Leading magic of every block.
pub const MAGIC: [u8; 8] = *b"fishtrap";

/// Fixed header: magic, protected length, protected hash.
pub const HEADER_LEN: usize = 24;

/// Process-wide seed for payload digests.
pub const HASH_SEED: u32 = 1179210568;

/// The magic bytes carry no parity, so up to this many of them may mismatch.
/// Header ECC and the payload digest reject false positives.
const MAGIC_TOLERANCE: usize = 2;

lazy_static! {
    static ref HEADER_RS: rs::ReedSolomon = rs::ReedSolomon::new(4, 4);
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode block payload")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("block payload of {0} bytes exceeds the length field")]
    PayloadTooLarge(usize),
}

/// Result of scanning a buffer for the next block.
///
/// `offset` is where the block (or the end of the buffer) was found and
/// `length` its total on-disk size. `data` is `None` when the buffer is
/// exhausted, when the block is truncated (its `length` tells how many bytes
/// it would occupy in full), or for a zero-payload block.
#[derive(Debug)]
pub struct ScanOutcome<T> {
    pub offset: usize,
    pub length: usize,
    pub data: Option<T>,
}

/// Frame `record` into a block: header plus MessagePack payload.
pub fn write_block<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>, Error> {
    let payload = rmp_serde::to_vec_named(record)?;
    if payload.len() > u32::MAX as usize {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&HEADER_RS.encode(&(payload.len() as u32).to_be_bytes()));
    out.extend_from_slice(&HEADER_RS.encode(&xxh32(&payload, HASH_SEED).to_be_bytes()));
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Scan `buf` from `start` for the next decodable block.
pub fn scan_block<T: DeserializeOwned>(buf: &[u8], start: usize) -> ScanOutcome<T> {
    let mut cursor = start;

    loop {
        // Too little room even for the magic and length fields.
        if cursor + 16 > buf.len() {
            return ScanOutcome {
                offset: buf.len(),
                length: 0,
                data: None,
            };
        }

        let mismatches = buf[cursor..cursor + 8]
            .iter()
            .zip(MAGIC.iter())
            .filter(|(a, b)| a != b)
            .count();
        if mismatches > MAGIC_TOLERANCE {
            cursor += 1;
            continue;
        }
        let offset = cursor;

        let length = match HEADER_RS.decode(&buf[offset + 8..offset + 16]) {
            Ok(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
            Err(_) => {
                cursor += 1;
                continue;
            }
        };

        if offset + HEADER_LEN + length > buf.len() {
            // Truncated: the header promises more bytes than the buffer holds.
            return ScanOutcome {
                offset,
                length: HEADER_LEN + length,
                data: None,
            };
        }
        if length == 0 {
            return ScanOutcome {
                offset,
                length: HEADER_LEN,
                data: None,
            };
        }

        let expect = match HEADER_RS.decode(&buf[offset + 16..offset + 24]) {
            Ok(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Err(_) => {
                cursor = offset + HEADER_LEN - 1 + length;
                continue;
            }
        };

        let payload = &buf[offset + HEADER_LEN..offset + HEADER_LEN + length];
        if xxh32(payload, HASH_SEED) != expect {
            cursor = offset + HEADER_LEN - 1 + length;
            continue;
        }

        match rmp_serde::from_slice::<T>(payload) {
            Ok(data) => {
                return ScanOutcome {
                    offset,
                    length: HEADER_LEN + length,
                    data: Some(data),
                }
            }
            Err(_) => {
                cursor = offset + HEADER_LEN - 1 + length;
                continue;
            }
        }
    }
}
