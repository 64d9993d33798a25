//! Contrastive atom sets shared by the SNPE-C and SRE losses.
//!
//! For a minibatch of `B` pairs `(θ_i, x_i)`, the atom set of example
//! `i` is `θ_i` followed by `K - 1` other parameters of the same
//! minibatch, drawn without replacement. Every atom of example `i` is
//! paired with `x_i`.

use sbi_util::error::{Result, SbiError};
use sbi_util::tensor_util::repeat_rows;

use candle_core::Tensor;
use rand::Rng;

/// The atoms `(B·K x d)` and their contexts `(B·K x m ...)`, example
/// by example: rows `i·K .. (i+1)·K` belong to example `i`, and row
/// `i·K` is the example's own parameter.
pub struct AtomSet {
    pub theta_atoms: Tensor,
    pub x_repeated: Tensor,
    pub num_atoms: usize,
    pub batch_size: usize,
}

/// Number of atoms `K` for a minibatch of size `batch_size`.
///
/// `num_atoms <= 0` uses the whole minibatch. A valid `K` satisfies
/// `0 < K - 1 < B`.
pub fn resolve_num_atoms(num_atoms: i64, batch_size: usize) -> Result<usize> {
    let k = if num_atoms > 0 {
        num_atoms as usize
    } else {
        batch_size
    };

    if k < 2 || k - 1 >= batch_size {
        return Err(SbiError::InvalidConfiguration(format!(
            "{} atoms: can't draw {} distinct contrasting parameters from a minibatch of {}",
            k,
            k as i64 - 1,
            batch_size
        )));
    }
    Ok(k)
}

/// Smallest minibatch holding `num_atoms` atoms per example; a
/// non-positive `num_atoms` adapts to any minibatch of two or more
pub fn min_atomic_batch_size(num_atoms: i64) -> usize {
    if num_atoms > 0 {
        (num_atoms as usize).max(2)
    } else {
        2
    }
}

///
/// For each example `i` in `0..batch_size`, draw `num_atoms - 1`
/// distinct indices from `{0, .., batch_size - 1} \ {i}`.
///
/// # Returns
/// row-major indices, `num_atoms - 1` per example
///
pub fn sample_atom_indices<R>(batch_size: usize, num_atoms: usize, rng: &mut R) -> Vec<u32>
where
    R: Rng + ?Sized,
{
    let num_contrast = num_atoms - 1;
    let mut ret = Vec::with_capacity(batch_size * num_contrast);
    for i in 0..batch_size {
        // draw from B - 1 slots and skip over `i`
        for c in rand::seq::index::sample(rng, batch_size - 1, num_contrast) {
            let j = if c >= i { c + 1 } else { c };
            ret.push(j as u32);
        }
    }
    ret
}

///
/// Build the atom sets of a minibatch
///
/// # Arguments
/// * `theta_nd` - parameters (B x d)
/// * `x_nm` - observations (B x m ...), row-aligned with `theta_nd`
/// * `num_atoms` - atoms per example; `<= 0` means `B`
/// * `rng` - random number generator for the contrasting draws
///
pub fn build_atom_set<R>(
    theta_nd: &Tensor,
    x_nm: &Tensor,
    num_atoms: i64,
    rng: &mut R,
) -> Result<AtomSet>
where
    R: Rng + ?Sized,
{
    if theta_nd.rank() != 2 {
        return Err(SbiError::Shape(format!(
            "expected a parameter batch (B x d), got {:?}",
            theta_nd.dims()
        )));
    }

    let batch_size = theta_nd.dim(0)?;
    if x_nm.rank() == 0 || x_nm.dim(0)? != batch_size {
        return Err(SbiError::Shape(format!(
            "parameters {:?} and observations {:?} are not row-aligned",
            theta_nd.dims(),
            x_nm.dims()
        )));
    }

    let k = resolve_num_atoms(num_atoms, batch_size)?;
    let contrast = sample_atom_indices(batch_size, k, rng);

    let mut atom_index = Vec::with_capacity(batch_size * k);
    for (i, others) in contrast.chunks(k - 1).enumerate() {
        atom_index.push(i as u32);
        atom_index.extend_from_slice(others);
    }

    let atom_index = Tensor::from_vec(atom_index, batch_size * k, theta_nd.device())?;
    let theta_atoms = theta_nd.index_select(&atom_index, 0)?;
    let x_repeated = repeat_rows(x_nm, k)?;

    Ok(AtomSet {
        theta_atoms,
        x_repeated,
        num_atoms: k,
        batch_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn atom_count_rules() {
        assert!(resolve_num_atoms(3, 4).is_ok());
        assert_eq!(resolve_num_atoms(4, 4).ok(), Some(4));
        assert_eq!(resolve_num_atoms(-1, 10).ok(), Some(10));
        assert_eq!(resolve_num_atoms(0, 10).ok(), Some(10));
        for (k, b) in [(5, 4), (1, 4), (2, 1), (-1, 1)] {
            assert!(
                matches!(
                    resolve_num_atoms(k, b),
                    Err(SbiError::InvalidConfiguration(_))
                ),
                "K = {}, B = {}",
                k,
                b
            );
        }
    }

    #[test]
    fn smallest_minibatch_holds_the_atoms() {
        for k in [-1, 0, 2, 3, 10] {
            let b = min_atomic_batch_size(k);
            assert!(resolve_num_atoms(k, b).is_ok(), "K = {}, B = {}", k, b);
            assert!(
                b == 2 || resolve_num_atoms(k, b - 1).is_err(),
                "K = {}, B = {}",
                k,
                b
            );
        }
    }

    #[test]
    fn contrasting_indices_skip_self_without_replacement() {
        let mut rng = StdRng::seed_from_u64(11);
        let (b, k) = (6, 5);
        let idx = sample_atom_indices(b, k, &mut rng);
        assert_eq!(idx.len(), b * (k - 1));
        for (i, row) in idx.chunks(k - 1).enumerate() {
            let distinct: HashSet<u32> = row.iter().copied().collect();
            assert_eq!(distinct.len(), k - 1);
            assert!(row.iter().all(|&j| j as usize != i && (j as usize) < b));
        }
    }

    #[test]
    fn every_other_row_is_a_possible_atom() {
        let mut rng = StdRng::seed_from_u64(5);
        let b = 5;
        let mut seen = vec![HashSet::new(); b];
        for _ in 0..200 {
            for (i, row) in sample_atom_indices(b, 2, &mut rng).chunks(1).enumerate() {
                seen[i].insert(row[0]);
            }
        }
        for (i, s) in seen.iter().enumerate() {
            assert_eq!(s.len(), b - 1, "row {} saw {:?}", i, s);
        }
    }

    #[test]
    fn atom_zero_is_the_own_parameter() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let theta = Tensor::arange(0u32, 8, &dev)?
            .to_dtype(DType::F32)?
            .reshape((4, 2))?;
        let x = Tensor::arange(0u32, 4, &dev)?
            .to_dtype(DType::F32)?
            .reshape((4, 1))?;
        let mut rng = StdRng::seed_from_u64(2);
        let atoms = build_atom_set(&theta, &x, 3, &mut rng)?;

        assert_eq!(atoms.theta_atoms.dims(), &[12, 2]);
        assert_eq!(atoms.x_repeated.dims(), &[12, 1]);

        let theta_atoms = atoms.theta_atoms.to_vec2::<f32>()?;
        let x_rep = atoms.x_repeated.flatten_all()?.to_vec1::<f32>()?;
        let theta_rows = theta.to_vec2::<f32>()?;
        for i in 0..4 {
            assert_eq!(theta_atoms[i * 3], theta_rows[i]);
            for j in 0..3 {
                assert_eq!(x_rep[i * 3 + j], i as f32);
            }
        }
        Ok(())
    }

    #[test]
    fn misaligned_batches_are_rejected() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let theta = Tensor::zeros((4, 2), DType::F32, &dev)?;
        let x = Tensor::zeros((3, 2), DType::F32, &dev)?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            build_atom_set(&theta, &x, 2, &mut rng),
            Err(SbiError::Shape(_))
        ));
        Ok(())
    }
}
