//! Systematic Reed-Solomon code over GF(2^16) with a Vandermonde-form
//! generator.
//!
//! For `k` data shards and `m` parity shards the generator is the
//! `(k+m) x k` Vandermonde matrix row-reduced so its top `k` rows are the
//! identity: data shards are stored verbatim and any `k` of the `k+m`
//! shards reconstruct the rest by inverting the corresponding row
//! submatrix.

use stratum_error::{Result, StratumError};

use crate::galois::{WORD_BYTES, gf_add, gf_inv, gf_mul, gf_pow};

/// Parity shards per group.
pub const PARITY_SHARDS: usize = 2;

/// Dense matrix over GF(2^16).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u16>,
}

impl GfMatrix {
    #[must_use]
    pub fn zero(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    #[must_use]
    pub fn identity(size: usize) -> Self {
        let mut matrix = Self::zero(size, size);
        for index in 0..size {
            matrix.set(index, index, 1);
        }
        matrix
    }

    /// Vandermonde matrix `V[r][c] = r^c` with distinct evaluation points.
    #[must_use]
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        let mut matrix = Self::zero(rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                matrix.set(row, col, gf_pow(row as u16, col as u32));
            }
        }
        matrix
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> u16 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: u16) {
        self.data[row * self.cols + col] = value;
    }

    #[must_use]
    pub fn row(&self, row: usize) -> &[u16] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Select a subset of rows.
    #[must_use]
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut out = Self::zero(rows.len(), self.cols);
        for (new_row, &old_row) in rows.iter().enumerate() {
            for col in 0..self.cols {
                out.set(new_row, col, self.get(old_row, col));
            }
        }
        out
    }

    #[must_use]
    pub fn multiply(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.rows, "inner dimensions must agree");
        let mut out = Self::zero(self.rows, other.cols);
        for row in 0..self.rows {
            for col in 0..other.cols {
                let mut acc = 0_u16;
                for inner in 0..self.cols {
                    acc = gf_add(acc, gf_mul(self.get(row, inner), other.get(inner, col)));
                }
                out.set(row, col, acc);
            }
        }
        out
    }

    /// Gauss-Jordan inversion. Fails if the matrix is singular.
    pub fn invert(&self) -> Result<Self> {
        if self.rows != self.cols {
            return Err(StratumError::internal("only square matrices invert"));
        }
        let size = self.rows;
        let mut work = self.clone();
        let mut inverse = Self::identity(size);

        for pivot in 0..size {
            if work.get(pivot, pivot) == 0 {
                let swap = (pivot + 1..size).find(|&row| work.get(row, pivot) != 0);
                let Some(swap) = swap else {
                    return Err(StratumError::internal("singular decode matrix"));
                };
                for col in 0..size {
                    let a = work.get(pivot, col);
                    work.set(pivot, col, work.get(swap, col));
                    work.set(swap, col, a);
                    let b = inverse.get(pivot, col);
                    inverse.set(pivot, col, inverse.get(swap, col));
                    inverse.set(swap, col, b);
                }
            }
            let scale = gf_inv(work.get(pivot, pivot));
            for col in 0..size {
                work.set(pivot, col, gf_mul(work.get(pivot, col), scale));
                inverse.set(pivot, col, gf_mul(inverse.get(pivot, col), scale));
            }
            for row in 0..size {
                if row == pivot {
                    continue;
                }
                let factor = work.get(row, pivot);
                if factor == 0 {
                    continue;
                }
                for col in 0..size {
                    let w = gf_add(work.get(row, col), gf_mul(factor, work.get(pivot, col)));
                    work.set(row, col, w);
                    let i = gf_add(
                        inverse.get(row, col),
                        gf_mul(factor, inverse.get(pivot, col)),
                    );
                    inverse.set(row, col, i);
                }
            }
        }
        Ok(inverse)
    }
}

/// The systematic generator for `k` data shards: identity on top, parity
/// coefficient rows below.
#[derive(Debug, Clone)]
pub struct RsCode {
    k: usize,
    generator: GfMatrix,
}

impl RsCode {
    /// Build the code for `k` data shards and [`PARITY_SHARDS`] parity
    /// shards. `k` must stay below 32 so every evaluation point is distinct
    /// well inside the field.
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 || k >= 32 {
            return Err(StratumError::OutOfRange {
                what: "data shard count".to_owned(),
                value: k.to_string(),
            });
        }
        let vandermonde = GfMatrix::vandermonde(k + PARITY_SHARDS, k);
        let top: Vec<usize> = (0..k).collect();
        let top_inverse = vandermonde.select_rows(&top).invert()?;
        let generator = vandermonde.multiply(&top_inverse);
        Ok(Self { k, generator })
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Coefficient row for shard `index` (`0..k` data, `k..k+m` parity).
    #[must_use]
    pub fn shard_row(&self, index: usize) -> &[u16] {
        self.generator.row(index)
    }

    /// Compute one parity shard (`parity_index` in `0..PARITY_SHARDS`) over
    /// equally sized data shards. Shard lengths must be even.
    pub fn encode_parity(&self, parity_index: usize, data: &[&[u8]]) -> Result<Vec<u8>> {
        if data.len() != self.k {
            return Err(StratumError::internal(format!(
                "expected {} data shards, got {}",
                self.k,
                data.len()
            )));
        }
        let shard_len = data[0].len();
        if data.iter().any(|shard| shard.len() != shard_len) {
            return Err(StratumError::internal("data shards differ in length"));
        }
        if shard_len % WORD_BYTES != 0 {
            return Err(StratumError::internal("shard length must be word aligned"));
        }
        let row = self.shard_row(self.k + parity_index);
        let mut parity = vec![0_u8; shard_len];
        for word in 0..shard_len / WORD_BYTES {
            let mut acc = 0_u16;
            for (shard, &coeff) in data.iter().zip(row.iter()) {
                let value = u16::from_le_bytes([
                    shard[word * WORD_BYTES],
                    shard[word * WORD_BYTES + 1],
                ]);
                acc = gf_add(acc, gf_mul(coeff, value));
            }
            parity[word * WORD_BYTES..word * WORD_BYTES + WORD_BYTES]
                .copy_from_slice(&acc.to_le_bytes());
        }
        Ok(parity)
    }

    /// Decode matrix for a set of `k` surviving shard indices: applied to
    /// the surviving shards it yields the original data shards.
    pub fn decode_matrix(&self, survivors: &[usize]) -> Result<GfMatrix> {
        if survivors.len() != self.k {
            return Err(StratumError::GroupInsufficient {
                missing: self.k.saturating_sub(survivors.len()),
                total: self.k + PARITY_SHARDS,
                tolerance: PARITY_SHARDS,
            });
        }
        self.generator.select_rows(survivors).invert()
    }

    /// Reconstruct all data shards from any `k` survivors, given as
    /// `(shard index, bytes)`.
    pub fn reconstruct(&self, survivors: &[(usize, &[u8])]) -> Result<Vec<Vec<u8>>> {
        let indices: Vec<usize> = survivors.iter().map(|&(index, _)| index).collect();
        let decode = self.decode_matrix(&indices)?;
        let shard_len = survivors
            .first()
            .map(|&(_, bytes)| bytes.len())
            .unwrap_or(0);
        if survivors.iter().any(|&(_, bytes)| bytes.len() != shard_len) {
            return Err(StratumError::internal("survivor shards differ in length"));
        }

        let mut out = vec![vec![0_u8; shard_len]; self.k];
        for word in 0..shard_len / WORD_BYTES {
            for (data_index, shard) in out.iter_mut().enumerate() {
                let mut acc = 0_u16;
                for (col, &(_, bytes)) in survivors.iter().enumerate() {
                    let value = u16::from_le_bytes([
                        bytes[word * WORD_BYTES],
                        bytes[word * WORD_BYTES + 1],
                    ]);
                    acc = gf_add(acc, gf_mul(decode.get(data_index, col), value));
                }
                shard[word * WORD_BYTES..word * WORD_BYTES + WORD_BYTES]
                    .copy_from_slice(&acc.to_le_bytes());
            }
        }
        Ok(out)
    }
}

/// Whether the generator for `k` data shards is systematic (identity on
/// its top `k` rows).
#[must_use]
pub fn generator_sanity(k: usize) -> bool {
    RsCode::new(k).is_ok_and(|code| {
        (0..k).all(|row| {
            code.shard_row(row)
                .iter()
                .enumerate()
                .all(|(col, &value)| if col == row { value == 1 } else { value == 0 })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shards(k: usize, len: usize, seed: u8) -> Vec<Vec<u8>> {
        (0..k)
            .map(|shard| {
                (0..len)
                    .map(|index| ((index * 31 + shard * 7) % 256) as u8 ^ seed)
                    .collect()
            })
            .collect()
    }

    fn encode_group(code: &RsCode, data: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let mut all = data.to_vec();
        for parity in 0..PARITY_SHARDS {
            all.push(code.encode_parity(parity, &refs).unwrap());
        }
        all
    }

    #[test]
    fn test_generator_is_systematic() {
        for k in [1, 2, 4, 8, 31] {
            assert!(generator_sanity(k), "k={k}");
        }
        assert!(RsCode::new(0).is_err());
        assert!(RsCode::new(32).is_err());
    }

    #[test]
    fn test_every_double_erasure_recovers() {
        let k = 4;
        let code = RsCode::new(k).unwrap();
        let data = shards(k, 64, 0);
        let all = encode_group(&code, &data);
        let total = k + PARITY_SHARDS;

        for first in 0..total {
            for second in first + 1..total {
                let survivors: Vec<(usize, &[u8])> = (0..total)
                    .filter(|&index| index != first && index != second)
                    .take(k)
                    .map(|index| (index, all[index].as_slice()))
                    .collect();
                let recovered = code.reconstruct(&survivors).unwrap();
                assert_eq!(recovered, data, "erased {first} and {second}");
            }
        }
    }

    #[test]
    fn test_triple_erasure_is_insufficient() {
        let k = 4;
        let code = RsCode::new(k).unwrap();
        let err = code.decode_matrix(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, StratumError::GroupInsufficient { .. }));
    }

    #[test]
    fn test_parity_changes_with_data() {
        let code = RsCode::new(3).unwrap();
        let a = shards(3, 32, 0);
        let b = shards(3, 32, 1);
        let refs_a: Vec<&[u8]> = a.iter().map(Vec::as_slice).collect();
        let refs_b: Vec<&[u8]> = b.iter().map(Vec::as_slice).collect();
        assert_ne!(
            code.encode_parity(0, &refs_a).unwrap(),
            code.encode_parity(0, &refs_b).unwrap()
        );
        assert_ne!(
            code.encode_parity(0, &refs_a).unwrap(),
            code.encode_parity(1, &refs_a).unwrap()
        );
    }

    #[test]
    fn test_odd_shard_length_rejected() {
        let code = RsCode::new(2).unwrap();
        let data = shards(2, 33, 0);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        assert!(code.encode_parity(0, &refs).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_two_erasures_reconstruct(
            k in 2_usize..8,
            words in 1_usize..64,
            seed in any::<u8>(),
            erase_a in any::<usize>(),
            erase_b in any::<usize>(),
        ) {
            let code = RsCode::new(k).unwrap();
            let data = shards(k, words * WORD_BYTES, seed);
            let all = encode_group(&code, &data);
            let total = k + PARITY_SHARDS;
            let first = erase_a % total;
            let mut second = erase_b % total;
            if second == first {
                second = (second + 1) % total;
            }

            let survivors: Vec<(usize, &[u8])> = (0..total)
                .filter(|&index| index != first && index != second)
                .take(k)
                .map(|index| (index, all[index].as_slice()))
                .collect();
            let recovered = code.reconstruct(&survivors).unwrap();
            prop_assert_eq!(recovered, data);
        }
    }
}
