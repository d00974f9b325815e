use crate::{beacon_client, parse_credentials};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tracing::info;
use validator_core::generator::discover_keystores;
use validator_core::{parse_hex_fixed, DomainType, EthdoSigner, ExitGenerator, GeneratorConfig};

#[derive(Subcommand, Debug)]
pub enum GenerateCommand {
    /// Generate validator voluntary exit messages for multiple keystores
    ///
    /// Each worker runs ethdo in its own temporary directory.
    VoluntaryExits(VoluntaryExitsArgs),
}

#[derive(Args, Debug)]
pub struct VoluntaryExitsArgs {
    /// Path to directory containing keystore files
    #[arg(long)]
    pub input: PathBuf,

    /// Path to directory where result files will be written
    #[arg(long)]
    pub output: PathBuf,

    /// Prefix for input files to match
    #[arg(long, default_value = "keystore-")]
    pub prefix: String,

    /// Withdrawal credentials (hex)
    #[arg(long, value_parser = parse_credentials)]
    pub withdrawal_credentials: [u8; 32],

    /// Passphrase for your keystore(s)
    #[arg(long, env = "KEYSTORE_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    /// Beacon node endpoint URL (e.g. 'http://localhost:5052')
    #[arg(long, env = "BEACON_URL")]
    pub beacon: String,

    /// Number of exits to generate per keystore
    #[arg(long, default_value_t = 50_000)]
    pub count: u64,

    /// Starting validator index; queried from the beacon node when unset
    #[arg(long)]
    pub index_start: Option<u64>,

    /// Offset added to the starting validator index
    #[arg(long, default_value_t = 0)]
    pub index_offset: u64,

    /// Number of parallel workers (default: number of CPU cores)
    #[arg(long)]
    pub workers: Option<usize>,

    /// BLS to execution change domain, for clients that omit it from /eth/v1/config/spec
    #[arg(long, value_parser = parse_domain_type)]
    pub domain_bls_to_execution_change: Option<DomainType>,

    /// ethdo binary
    #[arg(long, env = "ETHDO_PATH", default_value = EthdoSigner::DEFAULT_BINARY)]
    pub ethdo: PathBuf,
}

fn parse_domain_type(s: &str) -> Result<DomainType, validator_core::HexError> {
    parse_hex_fixed(s)
}

pub async fn run(cmd: GenerateCommand) -> Result<()> {
    match cmd {
        GenerateCommand::VoluntaryExits(args) => voluntary_exits(args).await,
    }
}

async fn voluntary_exits(args: VoluntaryExitsArgs) -> Result<()> {
    let defaults = GeneratorConfig::default();
    let num_workers = args.workers.unwrap_or(defaults.num_workers);
    if num_workers == 0 {
        bail!("number of workers must be at least 1");
    }

    info!(dir = %args.input.display(), prefix = %args.prefix, "Reading keystore files");
    let keystores =
        discover_keystores(&args.input, &args.prefix).context("failed to read keystores")?;

    let beacon = beacon_client(&args.beacon)?;
    let network = beacon
        .fetch_network_config(args.domain_bls_to_execution_change)
        .await
        .context("failed to fetch beacon configuration")?;
    info!("Beacon configuration fetched successfully");

    let config = GeneratorConfig {
        output_dir: args.output,
        withdrawal_credentials: args.withdrawal_credentials,
        iterations: args.count,
        index_start: args.index_start,
        index_offset: args.index_offset,
        num_workers,
        keystore_prefix: args.prefix,
        ..defaults
    };
    let signer = EthdoSigner::new(args.ethdo, args.passphrase);
    let generator = ExitGenerator::new(config, network, signer)?;

    let start_index = generator
        .resolve_start_index(&beacon)
        .await
        .context("failed to get validator start index")?;

    info!(
        start_index,
        workers = num_workers,
        keystores = keystores.len(),
        "Starting exit generation"
    );
    generator
        .run(&keystores, start_index)
        .await
        .context("failed to generate exits")?;

    info!(
        "Processing complete. Processed {} iterations for each keystore.",
        args.count
    );
    Ok(())
}
