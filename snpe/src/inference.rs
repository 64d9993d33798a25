use crate::atomic::min_atomic_batch_size;
use crate::posterior::NeuralPosterior;
use crate::round_data::{Minibatch, RoundData};
use crate::simulators::{simulate_in_batches, Simulator};
use crate::snpe_c::ProposalPosterior;
use crate::sre::{importance_resample, unnormalized_log_posterior, RatioEstimatorLoss, SreLoss};

use sbi_util::classifier::RatioClassifier;
use sbi_util::density::{ConditionalDensity, Standardize};
use sbi_util::distributions::Prior;
use sbi_util::tensor_util::ensure_observation_batched;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use rand::Rng;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            batch_size: 50,
            num_epochs: 100,
            device: Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SnpeCConfig {
    /// atoms per example; `<= 0` uses the whole minibatch
    pub num_atoms: i64,
    /// add the maximum-likelihood term on prior (round-0) samples
    pub use_combined_loss: bool,
    /// train rounds >= 1 without round-0 samples
    pub discard_prior_samples: bool,
    /// z-score observations with prior-predictive pilot simulations
    pub z_score_obs: bool,
    pub num_pilot_samples: usize,
    pub simulation_batch_size: usize,
}

impl Default for SnpeCConfig {
    fn default() -> Self {
        Self {
            num_atoms: -1,
            use_combined_loss: false,
            discard_prior_samples: false,
            z_score_obs: true,
            num_pilot_samples: 100,
            simulation_batch_size: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SreConfig {
    pub num_atoms: i64,
    pub loss: SreLoss,
    pub z_score_obs: bool,
    pub num_pilot_samples: usize,
    pub simulation_batch_size: usize,
}

impl Default for SreConfig {
    fn default() -> Self {
        Self {
            num_atoms: -1,
            loss: SreLoss::Atomic,
            z_score_obs: true,
            num_pilot_samples: 100,
            simulation_batch_size: 100,
        }
    }
}

///
/// Observation z-scoring estimated from `num_pilot_samples`
/// prior-predictive simulations
///
pub fn pilot_standardize<S, P, R>(
    simulator: &S,
    prior: &P,
    num_pilot_samples: usize,
    simulation_batch_size: usize,
    rng: &mut R,
) -> anyhow::Result<Standardize>
where
    S: Simulator,
    P: Prior,
    R: Rng + ?Sized,
{
    let theta = prior.sample(num_pilot_samples, rng)?;
    let x = simulate_in_batches(simulator, &theta, simulation_batch_size, rng)?;
    Ok(Standardize::from_samples(&x)?)
}

fn progress_bar(train_config: &TrainConfig) -> ProgressBar {
    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb
}

///
/// Minimize `loss_fn` over shuffled minibatches of `data` for
/// `train_config.num_epochs` epochs. Minibatches smaller than
/// `min_batch_size` are left out.
///
/// # Returns
/// average loss per epoch
///
fn train_epochs<R, L>(
    data: &mut RoundData,
    variable_map: &VarMap,
    min_batch_size: usize,
    discard_prior_samples: bool,
    train_config: &TrainConfig,
    rng: &mut R,
    mut loss_fn: L,
) -> anyhow::Result<Vec<f32>>
where
    R: Rng + ?Sized,
    L: FnMut(&Minibatch, &mut R) -> anyhow::Result<Tensor>,
{
    let device = &train_config.device;
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = progress_bar(train_config);
    let mut loss_trace = vec![];

    for epoch in 0..train_config.num_epochs {
        data.shuffle_minibatch(
            train_config.batch_size,
            min_batch_size,
            discard_prior_samples,
            rng,
        )?;
        let num_minibatch = data.num_minibatch();
        if num_minibatch == 0 {
            anyhow::bail!("not enough simulations for a single minibatch");
        }

        let mut loss_tot = 0f32;
        for b in 0..num_minibatch {
            let mb = data
                .minibatch(b)
                .ok_or_else(|| anyhow::anyhow!("missing minibatch #{}", b))?;
            let mb = Minibatch {
                theta: mb.theta.to_device(device)?,
                x: mb.x.to_device(device)?,
                masks: mb.masks.to_device(device)?,
            };
            let loss = loss_fn(&mb, rng)?;
            adam.backward_step(&loss)?;
            loss_tot += loss.to_scalar::<f32>()?;
        }
        loss_trace.push(loss_tot / num_minibatch as f32);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {}",
                epoch + 1,
                loss_trace.last().ok_or(anyhow::anyhow!("loss"))?
            );
        }
    }
    pb.finish_and_clear();
    Ok(loss_trace)
}

///
/// Multi-round SNPE-C. Round 0 fits q(θ | x) to prior simulations by
/// maximum likelihood; later rounds simulate from the current
/// posterior at `x_o` and train on the atomic proposal posterior.
///
pub struct SnpeC<'a, S, P, D>
where
    S: Simulator,
    P: Prior,
    D: ConditionalDensity,
{
    simulator: &'a S,
    prior: &'a P,
    x_o: Tensor,
    density: D,
    variable_map: VarMap,
    config: SnpeCConfig,
    data: RoundData,
}

impl<'a, S, P, D> SnpeC<'a, S, P, D>
where
    S: Simulator,
    P: Prior,
    D: ConditionalDensity,
{
    ///
    /// # Arguments
    /// * `simulator` - simulator
    /// * `prior` - prior p(θ)
    /// * `x_o` - observation of interest
    /// * `config` - SNPE-C options
    /// * `device` - where the density parameters live
    /// * `build_density` - density model from the optional observation
    ///   z-scoring and a variable builder
    /// * `rng` - random number generator for the pilot simulations
    ///
    pub fn new<F, R>(
        simulator: &'a S,
        prior: &'a P,
        x_o: &Tensor,
        config: SnpeCConfig,
        device: &Device,
        build_density: F,
        rng: &mut R,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(Option<Standardize>, VarBuilder) -> candle_core::Result<D>,
        R: Rng + ?Sized,
    {
        let x_o = ensure_observation_batched(x_o)?;
        let standardize = if config.z_score_obs {
            Some(pilot_standardize(
                simulator,
                prior,
                config.num_pilot_samples,
                config.simulation_batch_size,
                rng,
            )?)
        } else {
            None
        };

        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let density = build_density(standardize, vb)?;

        Ok(Self {
            simulator,
            prior,
            x_o,
            density,
            variable_map,
            config,
            data: RoundData::new(),
        })
    }

    pub fn density(&self) -> &D {
        &self.density
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    pub fn data(&self) -> &RoundData {
        &self.data
    }

    /// The current posterior q(θ | x) restricted to the prior support
    pub fn posterior(&self) -> NeuralPosterior<'_, D, P> {
        NeuralPosterior::new(&self.density, self.prior)
    }

    ///
    /// Run `num_rounds` rounds of simulation and training
    ///
    /// # Returns
    /// average loss per epoch, all rounds back to back
    ///
    pub fn run<R>(
        &mut self,
        num_rounds: usize,
        num_simulations_per_round: usize,
        train_config: &TrainConfig,
        rng: &mut R,
    ) -> anyhow::Result<Vec<f32>>
    where
        R: Rng + ?Sized,
    {
        let mut loss_trace = vec![];
        for round in 0..num_rounds {
            let theta = if round == 0 {
                self.prior.sample(num_simulations_per_round, rng)?
            } else {
                self.posterior()
                    .sample(num_simulations_per_round, &self.x_o, rng)?
            };
            let x = simulate_in_batches(
                self.simulator,
                &theta,
                self.config.simulation_batch_size,
                rng,
            )?;
            self.data.append_round(theta, x)?;

            info!(
                "round {}: {} simulations, {} in total",
                round + 1,
                num_simulations_per_round,
                self.data.num_samples()
            );

            let trace = self.train_round(round, train_config, rng)?;
            if let Some(last) = trace.last() {
                info!("round {}: final loss {}", round + 1, last);
            }
            loss_trace.extend(trace);
        }
        Ok(loss_trace)
    }

    fn train_round<R>(
        &mut self,
        round: usize,
        train_config: &TrainConfig,
        rng: &mut R,
    ) -> anyhow::Result<Vec<f32>>
    where
        R: Rng + ?Sized,
    {
        let estimator = ProposalPosterior::new(
            self.prior,
            self.config.num_atoms,
            self.config.use_combined_loss,
        );
        let density = &self.density;
        let discard = round > 0 && self.config.discard_prior_samples;
        let min_batch_size = if round == 0 {
            RoundData::MIN_BATCH_SIZE
        } else {
            min_atomic_batch_size(self.config.num_atoms)
        };

        train_epochs(
            &mut self.data,
            &self.variable_map,
            min_batch_size,
            discard,
            train_config,
            rng,
            |mb, rng| {
                let log_prob = if round == 0 {
                    density.log_prob(&mb.theta, &mb.x, false)?
                } else {
                    estimator.log_prob(density, &mb.theta, &mb.x, &mb.masks, rng)?
                };
                debug!("minibatch of {}", mb.theta.dim(0)?);
                Ok(log_prob.mean_all()?.neg()?)
            },
        )
    }
}

///
/// Sequential ratio estimation: a classifier d(θ, x) trained to tell
/// joint from marginal pairs. Every round simulates from the prior.
///
pub struct Sre<'a, S, P, C>
where
    S: Simulator,
    P: Prior,
    C: RatioClassifier,
{
    simulator: &'a S,
    prior: &'a P,
    x_o: Tensor,
    classifier: C,
    variable_map: VarMap,
    config: SreConfig,
    data: RoundData,
}

impl<'a, S, P, C> Sre<'a, S, P, C>
where
    S: Simulator,
    P: Prior,
    C: RatioClassifier,
{
    /// Same arguments as `SnpeC::new`, with a classifier builder
    pub fn new<F, R>(
        simulator: &'a S,
        prior: &'a P,
        x_o: &Tensor,
        config: SreConfig,
        device: &Device,
        build_classifier: F,
        rng: &mut R,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(Option<Standardize>, VarBuilder) -> candle_core::Result<C>,
        R: Rng + ?Sized,
    {
        let x_o = ensure_observation_batched(x_o)?;
        let standardize = if config.z_score_obs {
            Some(pilot_standardize(
                simulator,
                prior,
                config.num_pilot_samples,
                config.simulation_batch_size,
                rng,
            )?)
        } else {
            None
        };

        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let classifier = build_classifier(standardize, vb)?;

        Ok(Self {
            simulator,
            prior,
            x_o,
            classifier,
            variable_map,
            config,
            data: RoundData::new(),
        })
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    /// log p(θ | x_o) up to a constant
    pub fn unnormalized_log_posterior(&self, theta_nd: &Tensor) -> anyhow::Result<Tensor> {
        Ok(unnormalized_log_posterior(
            &self.classifier,
            self.prior,
            theta_nd,
            &self.x_o,
        )?)
    }

    /// Approximate posterior draws at `x_o` by importance resampling
    /// `num_proposals` prior draws
    pub fn sample_posterior<R>(
        &self,
        num_samples: usize,
        num_proposals: usize,
        rng: &mut R,
    ) -> anyhow::Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        Ok(importance_resample(
            &self.classifier,
            self.prior,
            &self.x_o,
            num_samples,
            num_proposals,
            rng,
        )?)
    }

    pub fn run<R>(
        &mut self,
        num_rounds: usize,
        num_simulations_per_round: usize,
        train_config: &TrainConfig,
        rng: &mut R,
    ) -> anyhow::Result<Vec<f32>>
    where
        R: Rng + ?Sized,
    {
        let loss = RatioEstimatorLoss::new(self.config.loss, self.config.num_atoms);
        let min_batch_size = match self.config.loss {
            SreLoss::Atomic => min_atomic_batch_size(self.config.num_atoms),
            SreLoss::Aalr => RoundData::MIN_BATCH_SIZE,
        };
        let mut loss_trace = vec![];

        for round in 0..num_rounds {
            let theta = self.prior.sample(num_simulations_per_round, rng)?;
            let x = simulate_in_batches(
                self.simulator,
                &theta,
                self.config.simulation_batch_size,
                rng,
            )?;
            self.data.append_round(theta, x)?;

            info!(
                "round {}: {} simulations, {} in total",
                round + 1,
                num_simulations_per_round,
                self.data.num_samples()
            );

            let classifier = &self.classifier;
            let trace = train_epochs(
                &mut self.data,
                &self.variable_map,
                min_batch_size,
                false,
                train_config,
                rng,
                |mb, rng| Ok(loss.loss(classifier, &mb.theta, &mb.x, rng)?),
            )?;
            if let Some(last) = trace.last() {
                info!("round {}: final loss {}", round + 1, last);
            }
            loss_trace.extend(trace);
        }
        Ok(loss_trace)
    }
}
