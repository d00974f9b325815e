use crate::{beacon_client, pubkey_set};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tracing::info;
use validator_core::{BlsPubkey, BlsVerifier, ExitRegistry};

#[derive(Subcommand, Debug)]
pub enum ExtractCommand {
    /// Copy the exit matching each pubkey's live validator index
    VoluntaryExits(VoluntaryExitsArgs),
}

#[derive(Args, Debug)]
pub struct VoluntaryExitsArgs {
    /// Path to directory containing exit files
    #[arg(long)]
    pub input: PathBuf,

    /// Path to directory to save extracted exit files
    #[arg(long)]
    pub output: PathBuf,

    /// Network (mainnet, holesky or hoodi)
    #[arg(long)]
    pub network: String,

    /// Withdrawal credentials (hex)
    #[arg(long)]
    pub withdrawal_credentials: String,

    /// Expected validator pubkeys (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    pub pubkeys: Vec<BlsPubkey>,

    /// Beacon node endpoint URL (e.g. 'http://localhost:5052')
    #[arg(long, env = "BEACON_URL")]
    pub beacon: String,
}

pub async fn run(cmd: ExtractCommand) -> Result<()> {
    match cmd {
        ExtractCommand::VoluntaryExits(args) => voluntary_exits(args).await,
    }
}

async fn voluntary_exits(args: VoluntaryExitsArgs) -> Result<()> {
    let expected = pubkey_set(&args.pubkeys);

    let registry = ExitRegistry::load(
        &args.input,
        &args.network,
        &args.withdrawal_credentials,
        &expected,
    )
    .context("failed to load exits")?;

    let written = registry
        .extract(&beacon_client(&args.beacon)?, &args.output)
        .await
        .context("failed to extract exits")?;
    info!(files = written.len(), output = %args.output.display(), "Exits extracted");

    let extracted = ExitRegistry::load(
        &args.output,
        &args.network,
        &args.withdrawal_credentials,
        &expected,
    )
    .context("failed to load extracted exits")?;
    extracted
        .validate_count(1)
        .context("failed to check exit count")?;
    extracted
        .verify(&BlsVerifier)
        .context("failed to verify extracted exits")?;

    println!(
        "✅ Successfully extracted {} sets of validator exits",
        registry.len()
    );
    Ok(())
}
