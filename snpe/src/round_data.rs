use candle_core::{DType, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// A minibatch of `(θ, x, mask)` triples
pub struct Minibatch {
    pub theta: Tensor,
    pub x: Tensor,
    pub masks: Tensor,
}

///
/// Training pairs accumulated over rounds. Round 0 is drawn from the
/// prior, and its examples carry mask 1; later rounds carry mask 0.
///
/// After `shuffle_minibatch` is called, `minibatch(b)` returns the
/// `b`-th minibatch of a random partition.
///
#[derive(Default)]
pub struct RoundData {
    theta: Vec<Tensor>,
    x: Vec<Tensor>,
    masks: Vec<Tensor>,
    shuffled: Vec<Minibatch>,
}

impl RoundData {
    /// Smallest minibatch the contrastive losses can use
    pub const MIN_BATCH_SIZE: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rounds(&self) -> usize {
        self.theta.len()
    }

    /// Number of pairs in all rounds
    pub fn num_samples(&self) -> usize {
        self.theta.iter().map(|t| t.dims()[0]).sum()
    }

    ///
    /// Append a round of simulations
    /// * `theta_nd` - parameters (n x d)
    /// * `x_nm` - simulated observations (n x m ...)
    ///
    pub fn append_round(&mut self, theta_nd: Tensor, x_nm: Tensor) -> anyhow::Result<()> {
        let n = theta_nd.dim(0)?;
        if x_nm.dim(0)? != n {
            anyhow::bail!(
                "{} parameters but {} observations",
                n,
                x_nm.dim(0)?
            );
        }
        if let Some(prev) = self.theta.first() {
            if prev.dims()[1..] != theta_nd.dims()[1..] {
                anyhow::bail!(
                    "parameter shape {:?} differs from earlier rounds {:?}",
                    theta_nd.dims(),
                    prev.dims()
                );
            }
        }

        let mask = if self.theta.is_empty() { 1. } else { 0. };
        let masks = (Tensor::ones(n, DType::F32, theta_nd.device())? * mask)?;

        self.theta.push(theta_nd);
        self.x.push(x_nm);
        self.masks.push(masks);
        self.shuffled.clear();
        Ok(())
    }

    ///
    /// Partition a random permutation of the stored pairs into
    /// minibatches. A trailing minibatch smaller than
    /// `min_batch_size` (and never smaller than `MIN_BATCH_SIZE`) is
    /// dropped, so every minibatch can hold the loss's atom sets.
    ///
    /// * `batch_size` - minibatch size
    /// * `min_batch_size` - smallest minibatch the loss accepts
    /// * `discard_prior_samples` - leave out round 0 (when there are later rounds)
    /// * `rng` - random number generator
    ///
    pub fn shuffle_minibatch<R>(
        &mut self,
        batch_size: usize,
        min_batch_size: usize,
        discard_prior_samples: bool,
        rng: &mut R,
    ) -> anyhow::Result<()>
    where
        R: Rng + ?Sized,
    {
        let min_batch_size = min_batch_size.max(Self::MIN_BATCH_SIZE);
        if batch_size < min_batch_size {
            anyhow::bail!(
                "batch size {} is smaller than the required {}",
                batch_size,
                min_batch_size
            );
        }
        if self.theta.is_empty() {
            anyhow::bail!("no simulations to train on");
        }

        let skip = if discard_prior_samples && self.num_rounds() > 1 {
            1
        } else {
            0
        };

        let theta = Tensor::cat(&self.theta[skip..], 0)?;
        let x = Tensor::cat(&self.x[skip..], 0)?;
        let masks = Tensor::cat(&self.masks[skip..], 0)?;

        let ntot = theta.dim(0)?;
        let mut samples: Vec<u32> = (0..ntot as u32).collect();
        samples.shuffle(rng);

        self.shuffled.clear();
        for chunk in samples.chunks(batch_size) {
            if chunk.len() < min_batch_size {
                continue;
            }
            let idx = Tensor::from_slice(chunk, chunk.len(), theta.device())?;
            self.shuffled.push(Minibatch {
                theta: theta.index_select(&idx, 0)?,
                x: x.index_select(&idx, 0)?,
                masks: masks.index_select(&idx, 0)?,
            });
        }
        Ok(())
    }

    pub fn num_minibatch(&self) -> usize {
        self.shuffled.len()
    }

    pub fn minibatch(&self, batch_idx: usize) -> Option<&Minibatch> {
        self.shuffled.get(batch_idx)
    }
}
