use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use clap::{Args, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use sbi_util::classifier::{MlpClassifier, MlpClassifierArgs};
use sbi_util::density::{
    AffineCouplingFlow, AffineCouplingFlowArgs, ConditionalDensity, ConditionalGaussian,
    ConditionalGaussianArgs, Standardize,
};
use sbi_util::distributions::{BoxUniform, GaussianPrior, Prior};

use crate::inference::{SnpeC, SnpeCConfig, Sre, SreConfig, TrainConfig};
use crate::simulators::{
    linear_gaussian_posterior_box_prior, linear_gaussian_posterior_gaussian_prior,
    unbiased_mmd_squared, LinearGaussian,
};
use crate::sre::SreLoss;

//
// CLI types
//

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PriorType {
    /// θ ~ N(0, I)
    Gaussian,
    /// θ ~ U[-1, 1)^d
    Uniform,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DensityType {
    /// Diagonal Gaussian with MLP mean and scale
    Gaussian,
    /// Conditional affine coupling flow
    Flow,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    #[arg(long, default_value = "2", help = "Parameter dimension")]
    pub dim: usize,

    #[arg(long, default_value = "1.0", help = "Simulator noise scale")]
    pub noise_std: f32,

    #[arg(long, default_value = "gaussian")]
    pub prior: PriorType,

    #[arg(long, default_value = "1")]
    pub rounds: usize,

    #[arg(long, default_value = "1000", help = "Simulations per round")]
    pub simulations: usize,

    #[arg(
        long,
        default_value = "-1",
        allow_hyphen_values = true,
        help = "Atoms per example (<= 0: whole minibatch)"
    )]
    pub num_atoms: i64,

    #[arg(long, default_value = "50", help = "Epochs per round")]
    pub epochs: usize,

    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    #[arg(long, default_value = "0.001")]
    pub lr: f32,

    #[arg(long, value_delimiter = ',', default_values_t = vec![50, 50], help = "Hidden layer sizes")]
    pub hidden: Vec<usize>,

    #[arg(long, help = "Don't z-score observations")]
    pub no_z_score: bool,

    #[arg(long, default_value = "100")]
    pub num_pilot_samples: usize,

    #[arg(long, default_value = "100")]
    pub simulation_batch_size: usize,

    #[arg(long, default_value = "500", help = "Posterior samples to summarize")]
    pub posterior_samples: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct SnpeCArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "gaussian")]
    pub density: DensityType,

    #[arg(long, default_value = "5", help = "Coupling layers of the flow")]
    pub num_transforms: usize,

    #[arg(long, help = "Add the maximum-likelihood term on prior samples")]
    pub combined_loss: bool,

    #[arg(long, help = "Drop prior samples from the second round on")]
    pub discard_prior_samples: bool,
}

#[derive(Args, Debug)]
pub struct SreArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "atomic")]
    pub loss: SreLoss,

    #[arg(long, default_value = "10000", help = "Prior draws for importance resampling")]
    pub num_proposals: usize,
}

//
// Helper functions
//

fn select_device(gpu: bool) -> Device {
    if gpu {
        #[cfg(target_os = "macos")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(target_os = "linux")]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

fn train_config(args: &CommonArgs, device: &Device) -> TrainConfig {
    TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
    }
}

/// Exact posterior draws at `x_o` for the chosen prior
fn reference_posterior(
    args: &CommonArgs,
    x_o: &Tensor,
    device: &Device,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let n = args.posterior_samples;
    let samples = match args.prior {
        PriorType::Gaussian => {
            linear_gaussian_posterior_gaussian_prior(x_o, 1., args.noise_std, n, rng)?
        }
        PriorType::Uniform => {
            let prior = BoxUniform::symmetric(args.dim, -1., 1., device)?;
            linear_gaussian_posterior_box_prior(x_o, &prior, args.noise_std, n, rng)?
        }
    };
    Ok(samples)
}

fn summarize(args: &CommonArgs, samples: &Tensor, x_o: &Tensor, rng: &mut StdRng) -> Result<()> {
    let mean = samples.mean(0)?.to_vec1::<f32>()?;
    let std = samples.var(0)?.sqrt()?.to_vec1::<f32>()?;
    info!("posterior mean: {:?}", mean);
    info!("posterior std:  {:?}", std);

    let reference = reference_posterior(args, x_o, samples.device(), rng)?;
    let mmd = unbiased_mmd_squared(&reference, samples)?;
    info!("MMD² to the exact posterior: {:.5}", mmd);
    Ok(())
}

//
// SNPE-C
//

fn fit_snpe_c<P, D, F>(
    args: &SnpeCArgs,
    prior: &P,
    x_o: &Tensor,
    device: &Device,
    build_density: F,
    rng: &mut StdRng,
) -> Result<Tensor>
where
    P: Prior,
    D: ConditionalDensity,
    F: FnOnce(Option<Standardize>, VarBuilder) -> candle_core::Result<D>,
{
    let common = &args.common;
    let simulator = LinearGaussian {
        noise_std: common.noise_std,
    };
    let config = SnpeCConfig {
        num_atoms: common.num_atoms,
        use_combined_loss: args.combined_loss,
        discard_prior_samples: args.discard_prior_samples,
        z_score_obs: !common.no_z_score,
        num_pilot_samples: common.num_pilot_samples,
        simulation_batch_size: common.simulation_batch_size,
    };

    let mut snpe = SnpeC::new(&simulator, prior, x_o, config, device, build_density, rng)?;
    let trace = snpe.run(
        common.rounds,
        common.simulations,
        &train_config(common, device),
        rng,
    )?;
    info!("trained {} epochs in total", trace.len());

    let x_o_1m = x_o.unsqueeze(0)?;
    Ok(snpe
        .posterior()
        .sample(common.posterior_samples, &x_o_1m, rng)?)
}

fn snpe_c_with_prior<P: Prior>(
    args: &SnpeCArgs,
    prior: &P,
    x_o: &Tensor,
    device: &Device,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let dim = args.common.dim;
    let layers = args.common.hidden.as_slice();
    match args.density {
        DensityType::Gaussian => fit_snpe_c(
            args,
            prior,
            x_o,
            device,
            |standardize, vb| {
                ConditionalGaussian::new(
                    ConditionalGaussianArgs {
                        dim_theta: dim,
                        dim_obs: dim,
                        layers,
                        standardize,
                    },
                    vb,
                )
            },
            rng,
        ),
        DensityType::Flow => fit_snpe_c(
            args,
            prior,
            x_o,
            device,
            |standardize, vb| {
                AffineCouplingFlow::new(
                    AffineCouplingFlowArgs {
                        dim_theta: dim,
                        dim_obs: dim,
                        num_transforms: args.num_transforms,
                        layers,
                        standardize,
                    },
                    vb,
                    device,
                )
            },
            rng,
        ),
    }
}

pub fn run_snpe_c(args: &SnpeCArgs) -> Result<()> {
    let common = &args.common;
    let device = select_device(common.gpu);
    info!("Using device: {:?}", device);

    let mut rng = StdRng::seed_from_u64(common.seed);
    let x_o = Tensor::zeros(common.dim, candle_core::DType::F32, &device)?;

    let samples = match common.prior {
        PriorType::Gaussian => {
            let prior = GaussianPrior::standard(common.dim, &device)?;
            snpe_c_with_prior(args, &prior, &x_o, &device, &mut rng)?
        }
        PriorType::Uniform => {
            let prior = BoxUniform::symmetric(common.dim, -1., 1., &device)?;
            snpe_c_with_prior(args, &prior, &x_o, &device, &mut rng)?
        }
    };

    summarize(common, &samples, &x_o, &mut rng)
}

//
// SRE
//

fn sre_with_prior<P: Prior>(
    args: &SreArgs,
    prior: &P,
    x_o: &Tensor,
    device: &Device,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let common = &args.common;
    let simulator = LinearGaussian {
        noise_std: common.noise_std,
    };
    let config = SreConfig {
        num_atoms: common.num_atoms,
        loss: args.loss,
        z_score_obs: !common.no_z_score,
        num_pilot_samples: common.num_pilot_samples,
        simulation_batch_size: common.simulation_batch_size,
    };

    let dim = common.dim;
    let layers = common.hidden.as_slice();
    let mut sre = Sre::new(
        &simulator,
        prior,
        x_o,
        config,
        device,
        |standardize, vb| {
            MlpClassifier::new(
                MlpClassifierArgs {
                    dim_theta: dim,
                    dim_obs: dim,
                    layers,
                    standardize,
                },
                vb,
            )
        },
        rng,
    )?;

    let trace = sre.run(
        common.rounds,
        common.simulations,
        &train_config(common, device),
        rng,
    )?;
    info!("trained {} epochs in total", trace.len());

    sre.sample_posterior(common.posterior_samples, args.num_proposals, rng)
}

pub fn run_sre(args: &SreArgs) -> Result<()> {
    let common = &args.common;
    let device = select_device(common.gpu);
    info!("Using device: {:?}", device);

    let mut rng = StdRng::seed_from_u64(common.seed);
    let x_o = Tensor::zeros(common.dim, candle_core::DType::F32, &device)?;

    let samples = match common.prior {
        PriorType::Gaussian => {
            let prior = GaussianPrior::standard(common.dim, &device)?;
            sre_with_prior(args, &prior, &x_o, &device, &mut rng)?
        }
        PriorType::Uniform => {
            let prior = BoxUniform::symmetric(common.dim, -1., 1., &device)?;
            sre_with_prior(args, &prior, &x_o, &device, &mut rng)?
        }
    };

    summarize(common, &samples, &x_o, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn parse_snpe_c_arguments() {
        let cli = Cli::parse_from([
            "snpe",
            "snpe-c",
            "--dim",
            "3",
            "--num-atoms",
            "-1",
            "--hidden",
            "20,10",
            "--combined-loss",
            "--prior",
            "uniform",
        ]);
        match cli.command {
            Commands::SnpeC(args) => {
                assert_eq!(args.common.dim, 3);
                assert_eq!(args.common.num_atoms, -1);
                assert_eq!(args.common.hidden, vec![20, 10]);
                assert!(args.combined_loss);
                assert!(matches!(args.common.prior, PriorType::Uniform));
                assert!(matches!(args.density, DensityType::Gaussian));
            }
            Commands::Sre(_) => panic!("expected snpe-c"),
        }
    }

    #[test]
    fn parse_sre_arguments() {
        let cli = Cli::parse_from(["snpe", "sre", "--loss", "aalr", "--num-atoms", "5"]);
        match cli.command {
            Commands::Sre(args) => {
                assert_eq!(args.loss, SreLoss::Aalr);
                assert_eq!(args.common.num_atoms, 5);
                assert_eq!(args.common.hidden, vec![50, 50]);
            }
            Commands::SnpeC(_) => panic!("expected sre"),
        }
    }
}
