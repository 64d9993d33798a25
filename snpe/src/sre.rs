use crate::atomic::build_atom_set;

use sbi_util::candle_loss_functions::{binary_cross_entropy_with_logits, log_sum_exp};
use sbi_util::classifier::RatioClassifier;
use sbi_util::distributions::Prior;
use sbi_util::error::{Result, SbiError};
use sbi_util::tensor_util::{check_finite, repeat_rows, tile};

use candle_core::{DType, Tensor};
use clap::ValueEnum;
use rand::Rng;
use rand_distr::{weighted::WeightedIndex, Distribution};

/// Ratio-estimator training objective
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SreLoss {
    /// Contrastive classification among `K` atoms (Durkan et al. 2020)
    Atomic,
    /// Joint vs. marginal binary classification (Hermans et al. 2019)
    Aalr,
}

/// Loss of a ratio classifier `d(θ, x)` on a minibatch
pub struct RatioEstimatorLoss {
    loss: SreLoss,
    num_atoms: i64,
}

impl RatioEstimatorLoss {
    /// * `loss` - objective
    /// * `num_atoms` - atoms per example for `Atomic` (`<= 0` uses the
    ///   whole minibatch); `Aalr` always uses two
    pub fn new(loss: SreLoss, num_atoms: i64) -> Self {
        let num_atoms = match loss {
            SreLoss::Atomic => num_atoms,
            SreLoss::Aalr => 2,
        };
        Self { loss, num_atoms }
    }

    pub fn loss_type(&self) -> SreLoss {
        self.loss
    }

    ///
    /// log softmax of the own-parameter logit among the atoms
    ///
    /// log p(i) = d(θ_i, x_i) - log sum_j exp d(θ_ij, x_i)
    ///
    pub fn atomic_log_prob<C, R>(
        &self,
        classifier: &C,
        theta_nd: &Tensor,
        x_nm: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        C: RatioClassifier,
        R: Rng + ?Sized,
    {
        let atoms = build_atom_set(theta_nd, x_nm, self.num_atoms, rng)?;
        let logits = classifier.logits(&atoms.theta_atoms, &atoms.x_repeated)?;
        check_finite(&logits, "classifier")?;
        let logits_bk = logits.reshape((atoms.batch_size, atoms.num_atoms))?;
        let own_b = logits_bk.narrow(1, 0, 1)?.squeeze(1)?;
        Ok((own_b - log_sum_exp(&logits_bk, 1)?)?)
    }

    /// Scalar loss to minimize
    pub fn loss<C, R>(
        &self,
        classifier: &C,
        theta_nd: &Tensor,
        x_nm: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        C: RatioClassifier,
        R: Rng + ?Sized,
    {
        match self.loss {
            SreLoss::Atomic => Ok(self
                .atomic_log_prob(classifier, theta_nd, x_nm, rng)?
                .mean_all()?
                .neg()?),
            SreLoss::Aalr => {
                // (θ_i, x_i) is labelled 1, (θ_c, x_i) with a contrast 0
                let atoms = build_atom_set(theta_nd, x_nm, 2, rng)?;
                let logits = classifier.logits(&atoms.theta_atoms, &atoms.x_repeated)?;
                check_finite(&logits, "classifier")?;
                let labels = Tensor::new(&[1_f32, 0.], logits.device())?;
                let labels = tile(&labels, atoms.batch_size)?.to_dtype(logits.dtype())?;
                Ok(binary_cross_entropy_with_logits(&logits, &labels)?)
            }
        }
    }
}

///
/// Unnormalized log posterior of a trained ratio estimator
///
/// log p(θ | x) + const = d(θ, x) + log p(θ)
///
/// * `x_nm` - observations aligned with `theta_nd`, or a single one
///
pub fn unnormalized_log_posterior<C, P>(
    classifier: &C,
    prior: &P,
    theta_nd: &Tensor,
    x_nm: &Tensor,
) -> Result<Tensor>
where
    C: RatioClassifier,
    P: Prior,
{
    let n = theta_nd.dim(0)?;
    let x_nm = if x_nm.dim(0)? == 1 && n > 1 {
        repeat_rows(x_nm, n)?
    } else {
        x_nm.clone()
    };
    let logits = classifier.logits(theta_nd, &x_nm)?;
    let log_prior = prior.log_prob(theta_nd)?.to_dtype(logits.dtype())?;
    Ok((logits + log_prior)?)
}

///
/// Sampling-importance-resampling from the ratio-estimator posterior:
/// draw `num_proposals` parameters from the prior, weight each by
/// exp d(θ, x_o), and resample `num_samples` with replacement
///
/// * `x_o` - the observation (1 x m ...)
///
pub fn importance_resample<C, P, R>(
    classifier: &C,
    prior: &P,
    x_o: &Tensor,
    num_samples: usize,
    num_proposals: usize,
    rng: &mut R,
) -> Result<Tensor>
where
    C: RatioClassifier,
    P: Prior,
    R: Rng + ?Sized,
{
    if num_proposals == 0 {
        return Err(SbiError::InvalidArgument(
            "need at least one proposal".into(),
        ));
    }

    let theta_nd = prior.sample(num_proposals, rng)?;
    let x_nm = repeat_rows(x_o, num_proposals)?;
    let logits = classifier.logits(&theta_nd, &x_nm)?.detach();
    check_finite(&logits, "classifier")?;

    let logits = logits.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let disc = WeightedIndex::new(&weights)
        .map_err(|e| SbiError::Numerical(format!("importance weights: {}", e)))?;

    let picked: Vec<u32> = (0..num_samples).map(|_| disc.sample(rng) as u32).collect();
    let picked = Tensor::from_vec(picked, num_samples, theta_nd.device())?;
    Ok(theta_nd.index_select(&picked, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbi_util::distributions::GaussianPrior;

    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// d(θ, x) = -|θ - x|²
    struct Distance;

    impl RatioClassifier for Distance {
        fn logits(&self, theta_nd: &Tensor, x_nm: &Tensor) -> candle_core::Result<Tensor> {
            (theta_nd - x_nm)?.sqr()?.sum(1)?.neg()
        }
    }

    #[test]
    fn aalr_forces_two_atoms() {
        let loss = RatioEstimatorLoss::new(SreLoss::Aalr, 10);
        assert_eq!(loss.num_atoms, 2);
        let loss = RatioEstimatorLoss::new(SreLoss::Atomic, 10);
        assert_eq!(loss.num_atoms, 10);
    }

    #[test]
    fn atomic_log_prob_is_a_log_softmax() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let theta = Tensor::randn(0f32, 1f32, (8, 2), &dev)?;
        let x = Tensor::randn(0f32, 1f32, (8, 2), &dev)?;
        let mut rng = StdRng::seed_from_u64(4);

        let loss = RatioEstimatorLoss::new(SreLoss::Atomic, 4);
        let log_p = loss.atomic_log_prob(&Distance, &theta, &x, &mut rng)?;
        assert_eq!(log_p.dims(), &[8]);
        assert!(log_p.to_vec1::<f32>()?.iter().all(|&v| v <= 1e-6));
        Ok(())
    }

    #[test]
    fn informative_classifier_beats_chance() -> anyhow::Result<()> {
        // x = θ exactly: the distance classifier picks the own atom
        let dev = Device::Cpu;
        let theta = Tensor::randn(0f32, 3f32, (32, 2), &dev)?;
        let mut rng = StdRng::seed_from_u64(8);

        let atomic = RatioEstimatorLoss::new(SreLoss::Atomic, 5);
        let l = atomic.loss(&Distance, &theta, &theta, &mut rng)?;
        assert!(l.to_scalar::<f32>()? < 5_f32.ln());

        let aalr = RatioEstimatorLoss::new(SreLoss::Aalr, -1);
        let l = aalr.loss(&Distance, &theta, &theta, &mut rng)?;
        assert!(l.to_scalar::<f32>()? < 2_f32.ln());
        Ok(())
    }

    #[test]
    fn resampled_posterior_concentrates() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let prior = GaussianPrior::standard(2, &dev)?;
        let x_o = Tensor::new(&[[1_f32, -1.]], &dev)?;
        let mut rng = StdRng::seed_from_u64(21);

        // exp(-|θ - x|²) N(θ; 0, I) ∝ N(θ; 2x/3, I/3)
        let theta = importance_resample(&Distance, &prior, &x_o, 2000, 20_000, &mut rng)?;
        assert_eq!(theta.dims(), &[2000, 2]);
        let mean = theta.mean(0)?.to_vec1::<f32>()?;
        assert!((mean[0] - 2. / 3.).abs() < 0.1, "{:?}", mean);
        assert!((mean[1] + 2. / 3.).abs() < 0.1, "{:?}", mean);

        let log_post = unnormalized_log_posterior(&Distance, &prior, &theta, &x_o)?;
        assert_eq!(log_post.dims(), &[2000]);
        Ok(())
    }
}
