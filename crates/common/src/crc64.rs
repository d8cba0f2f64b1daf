//! CRC64 (ECMA-182) computation and combination.
//!
//! TOS-compatible servers report object integrity through the
//! `x-tos-hash-crc64ecma` header: the CRC-64/XZ checksum (ECMA-182
//! polynomial, reflected) encoded as an unsigned decimal string. This module
//! provides the streaming digest used while piping part bodies and the GF(2)
//! matrix combination that folds per-part digests into a whole-object CRC.

use crc64fast::Digest;

/// Reflected form of the ECMA-182 generator polynomial.
const CRC64_ECMA_POLY_REFLECTED: u64 = 0xc96c_5795_d787_0f42;

/// Streaming CRC64 hasher for incremental computation.
///
/// Use this when digesting data chunk by chunk, such as while piping a
/// ranged response body to disk or reading a part body for upload.
pub struct Crc64 {
    inner: Digest,
}

impl Crc64 {
    /// Create a new streaming hasher.
    ///
    /// A hasher that never sees data digests to `"0"`, which is the valid
    /// digest of a zero-length object.
    pub fn new() -> Self {
        Self {
            inner: Digest::new(),
        }
    }

    /// Update the hasher with additional data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.write(data);
    }

    /// Finalize and return the checksum as u64.
    pub fn value(&self) -> u64 {
        self.inner.sum64()
    }

    /// Finalize and return the checksum in the server's textual encoding
    /// (unsigned decimal).
    pub fn digest(&self) -> String {
        self.value().to_string()
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the CRC64 of a byte slice in one call.
pub fn crc64_bytes(data: &[u8]) -> u64 {
    let mut hasher: Crc64 = Crc64::new();
    hasher.update(data);
    hasher.value()
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (i, &m) in mat.iter().enumerate() {
        square[i] = gf2_matrix_times(mat, m);
    }
}

/// Combine two CRC64 checksums.
///
/// Returns the CRC of the concatenation of two byte streams given only
/// their individual CRCs and the byte length of the second stream. `len2`
/// of zero returns `crc1` unchanged, so folding over an empty part list
/// (or a zero-length object) is well defined.
pub fn combine(crc1: u64, crc2: u64, len2: u64) -> u64 {
    // Degenerate case
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64]; // even-power-of-two zeros operator
    let mut odd = [0u64; 64]; // odd-power-of-two zeros operator

    // Put operator for one zero bit in odd
    odd[0] = CRC64_ECMA_POLY_REFLECTED;
    let mut row = 1u64;
    for odd_val in odd.iter_mut().skip(1) {
        *odd_val = row;
        row <<= 1;
    }

    // Put operator for two zero bits in even
    gf2_matrix_square(&mut even, &odd);

    // Put operator for four zero bits in odd
    gf2_matrix_square(&mut odd, &even);

    // Apply len2 zeros to crc1 (first square puts the operator for one
    // zero byte, eight zero bits, in even)
    let mut crc1n = crc1;
    let mut len2 = len2;

    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1n = gf2_matrix_times(&even, crc1n);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        // Another iteration with odd and even swapped
        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1n = gf2_matrix_times(&odd, crc1n);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1n ^ crc2
}

/// Combine two decimal-encoded CRC64 digests.
///
/// # Errors
/// Returns the offending string if either digest is not an unsigned
/// decimal integer.
pub fn combine_digests(a: &str, b: &str, len2: u64) -> Result<String, String> {
    let crc1: u64 = a.parse().map_err(|_| a.to_string())?;
    let crc2: u64 = b.parse().map_err(|_| b.to_string())?;
    Ok(combine(crc1, crc2, len2).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // CRC-64/XZ check value for the standard nine-byte test vector.
    const CHECK_INPUT: &[u8] = b"123456789";
    const CHECK_VALUE: u64 = 0x995d_c9bb_df19_39fa;

    #[test]
    fn test_known_check_value() {
        assert_eq!(crc64_bytes(CHECK_INPUT), CHECK_VALUE);
    }

    #[test]
    fn test_empty_digest_is_zero() {
        let hasher: Crc64 = Crc64::new();
        assert_eq!(hasher.value(), 0);
        assert_eq!(hasher.digest(), "0");
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher: Crc64 = Crc64::new();
        hasher.update(b"1234");
        hasher.update(b"56789");
        assert_eq!(hasher.value(), crc64_bytes(CHECK_INPUT));
    }

    #[test]
    fn test_combine_matches_direct() {
        let a = b"The quick brown fox ";
        let b = b"jumps over the lazy dog";
        let whole: Vec<u8> = [a.as_slice(), b.as_slice()].concat();

        let combined: u64 = combine(crc64_bytes(a), crc64_bytes(b), b.len() as u64);
        assert_eq!(combined, crc64_bytes(&whole));
    }

    #[test]
    fn test_combine_zero_length_is_identity() {
        let crc: u64 = crc64_bytes(b"payload");
        assert_eq!(combine(crc, 0, 0), crc);
        assert_eq!(combine(crc, crc64_bytes(b""), 0), crc);
    }

    #[test]
    fn test_combine_from_zero_seed() {
        // Folding parts starting from the empty-object digest reproduces
        // the whole-object CRC.
        let crc: u64 = crc64_bytes(CHECK_INPUT);
        assert_eq!(combine(0, crc, CHECK_INPUT.len() as u64), crc);
    }

    #[test]
    fn test_combine_associative() {
        let a = b"alpha";
        let b = b"bravo-bravo";
        let c = b"charlie";
        let (ca, cb, cc) = (crc64_bytes(a), crc64_bytes(b), crc64_bytes(c));
        let (lb, lc) = (b.len() as u64, c.len() as u64);

        let left: u64 = combine(combine(ca, cb, lb), cc, lc);
        let right: u64 = combine(ca, combine(cb, cc, lc), lb + lc);
        assert_eq!(left, right);
    }

    #[test]
    fn test_combine_many_parts() {
        let data: Vec<u8> = (0u32..10_000).flat_map(|i| i.to_le_bytes()).collect();
        let part_size: usize = 7177;

        let mut acc = 0u64;
        for chunk in data.chunks(part_size) {
            acc = combine(acc, crc64_bytes(chunk), chunk.len() as u64);
        }
        assert_eq!(acc, crc64_bytes(&data));
    }

    #[test]
    fn test_combine_digests_decimal() {
        let a = b"part one|";
        let b = b"part two";
        let whole: Vec<u8> = [a.as_slice(), b.as_slice()].concat();

        let combined: String = combine_digests(
            &crc64_bytes(a).to_string(),
            &crc64_bytes(b).to_string(),
            b.len() as u64,
        )
        .unwrap();
        assert_eq!(combined, crc64_bytes(&whole).to_string());
    }

    #[test]
    fn test_combine_digests_rejects_non_numeric() {
        let result = combine_digests("not-a-number", "0", 1);
        assert_eq!(result.unwrap_err(), "not-a-number");
    }
}
