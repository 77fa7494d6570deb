//! Reed-Solomon forward error correction over GF(2^8).
//!
//! Chunked systematic codes: every `chunk_len` data bytes are followed by
//! `n_sym` parity bytes, and up to `n_sym / 2` corrupted bytes per chunk can
//! be located and corrected in place. Block headers use the (4, 4)
//! configuration, protecting each four-byte field with four parity bytes.

use lazy_static::lazy_static;

/// Field reduction polynomial: x^8 + x^4 + x^3 + x^2 + 1.
const FIELD_POLY: u16 = 0x11d;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The error locator degree exceeds the correction capacity of the code.
    #[error("too many byte errors to correct")]
    TooManyErrors,
    /// Error positions could not be located, or correction left residual
    /// syndromes. The chunk cannot be trusted.
    #[error("could not find byte error locations")]
    CouldNotFindErrors,
}

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

lazy_static! {
    static ref GF: Tables = {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= FIELD_POLY;
            }
        }
        // Doubled exp table lets products index without a modulo.
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    };
}

#[inline]
fn exp(i: usize) -> u8 {
    GF.exp[i]
}

#[inline]
fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
    }
}

#[inline]
fn div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0, "division by zero in GF(2^8)");
    if a == 0 {
        0
    } else {
        GF.exp[GF.log[a as usize] as usize + 255 - GF.log[b as usize] as usize]
    }
}

/// Evaluate a polynomial (highest-order coefficient first) at `x`.
fn eval(poly: &[u8], x: u8) -> u8 {
    let mut y = poly[0];
    for &c in &poly[1..] {
        y = mul(y, x) ^ c;
    }
    y
}

/// Evaluate a polynomial (lowest-order coefficient first) at `x`.
fn eval_low(poly: &[u8], x: u8) -> u8 {
    let mut y = 0;
    let mut xp = 1;
    for &c in poly {
        y ^= mul(c, xp);
        xp = mul(xp, x);
    }
    y
}

pub struct ReedSolomon {
    n_sym: usize,
    chunk_len: usize,
    /// `Π_{i=0..n_sym-1} (x - α^i)`, highest-order coefficient first.
    generator: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(n_sym: usize, chunk_len: usize) -> Self {
        assert!(n_sym >= 1 && chunk_len >= 1 && chunk_len + n_sym <= 255);

        let mut generator = vec![1u8];
        for i in 0..n_sym {
            let root = exp(i);
            let mut next = vec![0u8; generator.len() + 1];
            for (j, &c) in generator.iter().enumerate() {
                next[j] ^= c;
                next[j + 1] ^= mul(c, root);
            }
            generator = next;
        }

        Self {
            n_sym,
            chunk_len,
            generator,
        }
    }

    /// Encoded length of `data_len` input bytes.
    pub fn encoded_len(&self, data_len: usize) -> usize {
        let chunks = (data_len + self.chunk_len - 1) / self.chunk_len;
        data_len + chunks * self.n_sym
    }

    /// Systematic encoding: each chunk of input is emitted verbatim, followed
    /// by the remainder of `chunk · x^n_sym` modulo the generator polynomial.
    pub fn encode(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len(input.len()));
        for chunk in input.chunks(self.chunk_len) {
            self.encode_chunk(chunk, &mut out);
        }
        out
    }

    /// Decode an encoded buffer, correcting up to `n_sym / 2` byte errors per
    /// chunk, and return the data bytes with parity stripped.
    pub fn decode(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(input.len());
        for chunk in input.chunks(self.chunk_len + self.n_sym) {
            if chunk.len() <= self.n_sym {
                return Err(Error::CouldNotFindErrors);
            }
            let mut chunk = chunk.to_vec();
            self.decode_chunk(&mut chunk)?;
            out.extend_from_slice(&chunk[..chunk.len() - self.n_sym]);
        }
        Ok(out)
    }

    fn encode_chunk(&self, data: &[u8], out: &mut Vec<u8>) {
        // Polynomial long division over a scratch copy; the quotient is
        // discarded and the remainder becomes the parity bytes.
        let mut msg = vec![0u8; data.len() + self.n_sym];
        msg[..data.len()].copy_from_slice(data);
        for i in 0..data.len() {
            let c = msg[i];
            if c != 0 {
                for j in 1..self.generator.len() {
                    msg[i + j] ^= mul(self.generator[j], c);
                }
            }
        }
        out.extend_from_slice(data);
        out.extend_from_slice(&msg[data.len()..]);
    }

    fn syndromes(&self, chunk: &[u8]) -> Vec<u8> {
        (0..self.n_sym).map(|i| eval(chunk, exp(i))).collect()
    }

    fn decode_chunk(&self, chunk: &mut [u8]) -> Result<(), Error> {
        let synd = self.syndromes(chunk);
        if synd.iter().all(|&s| s == 0) {
            return Ok(());
        }

        // Berlekamp-Massey recurrence for the error locator polynomial.
        let mut err_loc: Vec<u8> = vec![1];
        let mut old_loc: Vec<u8> = vec![1];
        for i in 0..self.n_sym {
            old_loc.push(0);
            let mut delta = synd[i];
            for j in 1..err_loc.len() {
                delta ^= mul(err_loc[err_loc.len() - 1 - j], synd[i - j]);
            }
            if delta != 0 {
                if old_loc.len() > err_loc.len() {
                    let next: Vec<u8> = old_loc.iter().map(|&c| mul(c, delta)).collect();
                    old_loc = err_loc.iter().map(|&c| div(c, delta)).collect();
                    err_loc = next;
                }
                let n = err_loc.len();
                let m = old_loc.len();
                for j in 0..m {
                    err_loc[n - 1 - j] ^= mul(delta, old_loc[m - 1 - j]);
                }
            }
        }
        while err_loc.first() == Some(&0) {
            err_loc.remove(0);
        }
        if err_loc.is_empty() {
            return Err(Error::CouldNotFindErrors);
        }
        let errs = err_loc.len() - 1;
        if errs * 2 > self.n_sym {
            return Err(Error::TooManyErrors);
        }

        // Chien search: error positions are the roots α^-i of the locator.
        let len = chunk.len();
        let mut err_pos = Vec::with_capacity(errs);
        for i in 0..len {
            if eval(&err_loc, exp((255 - i) % 255)) == 0 {
                err_pos.push(len - 1 - i);
            }
        }
        if err_pos.len() != errs {
            return Err(Error::CouldNotFindErrors);
        }

        // Forney: error magnitudes from the evaluator Ω = S·Λ mod x^n_sym.
        let lam: Vec<u8> = err_loc.iter().rev().copied().collect();
        let mut omega = vec![0u8; self.n_sym];
        for i in 0..self.n_sym {
            for (j, &l) in lam.iter().enumerate() {
                if i + j < self.n_sym {
                    omega[i + j] ^= mul(synd[i], l);
                }
            }
        }
        // Formal derivative of Λ: odd-power coefficients shift down.
        let mut lam_der = vec![0u8; lam.len().saturating_sub(1)];
        for j in (1..lam.len()).step_by(2) {
            lam_der[j - 1] = lam[j];
        }

        for &pos in &err_pos {
            let i = len - 1 - pos;
            let x = exp(i);
            let x_inv = exp((255 - i) % 255);
            let num = eval_low(&omega, x_inv);
            let den = eval_low(&lam_der, x_inv);
            if den == 0 {
                return Err(Error::CouldNotFindErrors);
            }
            chunk[pos] ^= mul(x, div(num, den));
        }

        // Corrections must cancel every syndrome; residue means the locator
        // lied about the actual error pattern.
        if self.syndromes(chunk).iter().any(|&s| s != 0) {
            return Err(Error::CouldNotFindErrors);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ReedSolomon};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn header_code() -> ReedSolomon {
        ReedSolomon::new(4, 4)
    }

    #[test]
    fn generator_polynomial() {
        assert_eq!(header_code().generator, vec![1, 15, 54, 120, 64]);
    }

    #[test]
    fn encodes_reference_chunks() {
        let rs = header_code();
        assert_eq!(
            rs.encode(&[116, 101, 115, 116]),
            vec![116, 101, 115, 116, 102, 82, 51, 17]
        );
        assert_eq!(rs.encode(&[1, 2, 3, 4]), vec![1, 2, 3, 4, 117, 163, 178, 96]);
        assert_eq!(
            rs.encode(&[0xde, 0xad, 0xbe, 0xef]),
            vec![0xde, 0xad, 0xbe, 0xef, 0x83, 0x86, 0xc9, 0xee]
        );
        assert_eq!(rs.encode(&[0, 0, 0, 0]), vec![0; 8]);
    }

    #[test]
    fn decodes_clean_chunk() {
        let rs = header_code();
        let enc = rs.encode(&[116, 101, 115, 116]);
        assert_eq!(rs.decode(&enc).unwrap(), vec![116, 101, 115, 116]);
    }

    #[test]
    fn corrects_one_and_two_errors() {
        let rs = header_code();
        let enc = rs.encode(&[116, 101, 115, 116]);

        let mut one = enc.clone();
        one[7] ^= 0x80; // parity byte
        assert_eq!(rs.decode(&one).unwrap(), vec![116, 101, 115, 116]);

        let mut two = enc.clone();
        two[1] ^= 0x55;
        two[6] ^= 0x0f;
        assert_eq!(rs.decode(&two).unwrap(), vec![116, 101, 115, 116]);
    }

    #[test]
    fn three_errors_are_uncorrectable() {
        let rs = header_code();
        let mut enc = rs.encode(&[116, 101, 115, 116]);
        enc[0] ^= 1;
        enc[2] ^= 7;
        enc[5] ^= 9;
        assert_eq!(rs.decode(&enc), Err(Error::CouldNotFindErrors));
    }

    #[test]
    fn round_trip_with_random_corruption() {
        let rs = header_code();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..500 {
            let len = rng.gen_range(1..=64);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut enc = rs.encode(&data);

            // Corrupt up to two bytes within a single encoded chunk.
            let chunks = (enc.len() + 7) / 8;
            let chunk = rng.gen_range(0..chunks);
            let lo = chunk * 8;
            let hi = (lo + 8).min(enc.len());
            for _ in 0..rng.gen_range(0..=2) {
                let pos = rng.gen_range(lo..hi);
                enc[pos] ^= rng.gen_range(1..=255u8);
            }

            assert_eq!(rs.decode(&enc).unwrap(), data);
        }
    }

    #[test]
    fn long_input_round_trip() {
        let rs = ReedSolomon::new(4, 4);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let enc = rs.encode(&data);
        assert_eq!(enc.len(), rs.encoded_len(data.len()));
        assert_eq!(rs.decode(&enc).unwrap(), data);
    }

    #[test]
    fn wider_chunk_configuration() {
        let rs = ReedSolomon::new(4, 8);
        let data = b"chunk configuration".to_vec();
        let mut enc = rs.encode(&data);
        enc[3] ^= 0xaa;
        enc[14] ^= 0x11;
        assert_eq!(rs.decode(&enc).unwrap(), data);
    }
}
