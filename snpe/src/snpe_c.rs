use crate::atomic::build_atom_set;
use crate::calibration::{CalibrationKernel, ConstantKernel};

use sbi_util::candle_loss_functions::log_sum_exp;
use sbi_util::density::ConditionalDensity;
use sbi_util::distributions::Prior;
use sbi_util::error::{Result, SbiError};
use sbi_util::tensor_util::check_finite;

use candle_core::Tensor;
use rand::Rng;

///
/// Atomic proposal posterior of SNPE-C (automatic posterior
/// transformation, Greenberg et al. 2019).
///
/// Training pairs `(θ_i, x_i)` may come from any mix of proposals.
/// For each example, its own parameter is scored against `K - 1`
/// contrasting parameters from the same minibatch:
///
/// ```text
/// w(i,j)    = log q(θ_ij | x_i) - log p(θ_ij)
/// result(i) = κ(x_i) * w(i,0) - log sum_j exp w(i,j)
/// ```
///
/// With the combined loss, `mask(i) * log q(θ_i | x_i)` is added so that
/// flagged (prior-drawn) examples also fit the density directly.
///
pub struct ProposalPosterior<'a, P, C = ConstantKernel>
where
    P: Prior,
    C: CalibrationKernel,
{
    prior: &'a P,
    calibration: C,
    num_atoms: i64,
    use_combined_loss: bool,
}

impl<'a, P> ProposalPosterior<'a, P, ConstantKernel>
where
    P: Prior,
{
    /// * `prior` - prior p(θ)
    /// * `num_atoms` - atoms per example; `<= 0` uses the whole minibatch
    /// * `use_combined_loss` - add the masked non-atomic term
    pub fn new(prior: &'a P, num_atoms: i64, use_combined_loss: bool) -> Self {
        Self {
            prior,
            calibration: ConstantKernel,
            num_atoms,
            use_combined_loss,
        }
    }
}

impl<'a, P, C> ProposalPosterior<'a, P, C>
where
    P: Prior,
    C: CalibrationKernel,
{
    pub fn with_calibration_kernel<K>(self, calibration: K) -> ProposalPosterior<'a, P, K>
    where
        K: CalibrationKernel,
    {
        ProposalPosterior {
            prior: self.prior,
            calibration,
            num_atoms: self.num_atoms,
            use_combined_loss: self.use_combined_loss,
        }
    }

    pub fn num_atoms(&self) -> i64 {
        self.num_atoms
    }

    pub fn use_combined_loss(&self) -> bool {
        self.use_combined_loss
    }

    ///
    /// Log-probability of each example's own parameter under the
    /// proposal posterior
    ///
    /// # Arguments
    /// * `density` - conditional density model q(θ | x)
    /// * `theta_nd` - parameters (B x d)
    /// * `x_nm` - observations (B x m ...)
    /// * `masks_n` - which examples also enter the non-atomic term (B,)
    /// * `rng` - random number generator for the contrasting atoms
    ///
    /// # Returns
    /// differentiable log-probabilities (B,)
    ///
    pub fn log_prob<D, R>(
        &self,
        density: &D,
        theta_nd: &Tensor,
        x_nm: &Tensor,
        masks_n: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        D: ConditionalDensity,
        R: Rng + ?Sized,
    {
        let atoms = build_atom_set(theta_nd, x_nm, self.num_atoms, rng)?;
        let (nb, nk) = (atoms.batch_size, atoms.num_atoms);

        if masks_n.elem_count() != nb {
            return Err(SbiError::Shape(format!(
                "{} masks for a minibatch of {}",
                masks_n.elem_count(),
                nb
            )));
        }

        let log_q = density.log_prob(&atoms.theta_atoms, &atoms.x_repeated, false)?;
        check_finite(&log_q, "posterior")?;
        let log_q_bk = log_q.reshape((nb, nk))?;

        let log_prior = self.prior.log_prob(&atoms.theta_atoms)?;
        let log_prior_bk = log_prior.reshape((nb, nk))?.to_dtype(log_q_bk.dtype())?;
        check_finite(&log_prior_bk, "prior")?;

        let w_bk = (log_q_bk - log_prior_bk)?;
        let w_own_b = w_bk.narrow(1, 0, 1)?.squeeze(1)?;
        let kappa_b = self.calibration.weight(x_nm)?.to_dtype(w_bk.dtype())?;

        let log_prob_b = (kappa_b.broadcast_mul(&w_own_b)? - log_sum_exp(&w_bk, 1)?)?;
        check_finite(&log_prob_b, "proposal posterior")?;

        if !self.use_combined_loss {
            return Ok(log_prob_b);
        }

        let log_q_b = density.log_prob(theta_nd, x_nm, false)?;
        let masks_b = masks_n.flatten_all()?.to_dtype(log_q_b.dtype())?;
        Ok((log_prob_b + masks_b.mul(&log_q_b)?)?)
    }

    /// Closed-form proposal posterior for mixture-of-Gaussians density
    /// estimators under Gaussian proposals. Not available.
    pub fn log_prob_proposal_mog(
        &self,
        _theta_nd: &Tensor,
        _x_nm: &Tensor,
        _masks_n: &Tensor,
    ) -> Result<Tensor> {
        Err(SbiError::NotSupported(
            "mixture-of-Gaussians proposal posterior".into(),
        ))
    }
}
