pub mod linear_gaussian;

use clap::{Parser, Subcommand};

pub use linear_gaussian::{CommonArgs, DensityType, PriorType, SnpeCArgs, SreArgs};

#[derive(Parser)]
#[command(name = "snpe")]
#[command(about = "Sequential neural posterior and ratio estimation on a linear Gaussian model")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run SNPE-C (automatic posterior transformation)
    SnpeC(SnpeCArgs),
    /// Run sequential ratio estimation
    Sre(SreArgs),
}
