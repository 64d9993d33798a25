use anyhow::Result;
use clap::Parser;
use snpe::cli::{linear_gaussian, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::SnpeC(args) => {
            linear_gaussian::run_snpe_c(args)?;
        }
        Commands::Sre(args) => {
            linear_gaussian::run_sre(args)?;
        }
    }

    Ok(())
}
