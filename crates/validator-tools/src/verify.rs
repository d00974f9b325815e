use crate::{parse_credentials, pubkey_set};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use validator_core::{
    BlsPubkey, BlsVerifier, DepositBatch, ExitRegistry, ExpectedDepositCriteria,
};

#[derive(Subcommand, Debug)]
pub enum VerifyCommand {
    /// Verify deposit data file format and contents
    DepositData(DepositDataArgs),

    /// Verify voluntary exit messages
    VoluntaryExits(VoluntaryExitsArgs),
}

#[derive(Args, Debug)]
pub struct DepositDataArgs {
    /// Path to deposit data JSON file
    #[arg(long)]
    pub deposit_data: PathBuf,

    /// Expected network (e.g. mainnet, hoodi)
    #[arg(long, default_value = "")]
    pub network: String,

    /// Expected deposit amount in Gwei
    #[arg(long, default_value_t = 32_000_000_000)]
    pub amount: u64,

    /// Expected withdrawal credentials (hex)
    #[arg(long, value_parser = parse_credentials)]
    pub withdrawal_credentials: Option<[u8; 32]>,

    /// Expected number of deposits
    #[arg(long, default_value_t = 0)]
    pub count: usize,
}

#[derive(Args, Debug)]
pub struct VoluntaryExitsArgs {
    /// Path to directory containing exit files
    #[arg(long)]
    pub input: PathBuf,

    /// Network (mainnet, holesky or hoodi)
    #[arg(long)]
    pub network: String,

    /// Withdrawal credentials (hex)
    #[arg(long)]
    pub withdrawal_credentials: String,

    /// Expected validator pubkeys (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    pub pubkeys: Vec<BlsPubkey>,

    /// Number of exits that should have been generated per pubkey
    #[arg(long, default_value_t = 0)]
    pub count: usize,

    /// Skip the check that all pubkeys cover the same index range
    #[arg(long)]
    pub skip_index_mismatch_check: bool,

    /// Skip the live validator index hint
    #[arg(long)]
    pub skip_check_message: bool,
}

pub fn run(cmd: VerifyCommand) -> Result<()> {
    match cmd {
        VerifyCommand::DepositData(args) => deposit_data(args, &mut std::io::stdout().lock()),
        VerifyCommand::VoluntaryExits(args) => voluntary_exits(args),
    }
}

fn deposit_data(args: DepositDataArgs, out: &mut impl Write) -> Result<()> {
    let criteria = ExpectedDepositCriteria {
        network: args.network,
        amount: args.amount,
        withdrawal_credentials: args.withdrawal_credentials,
        count: args.count,
    };

    let batch = DepositBatch::load(&args.deposit_data).context("failed to load deposit data")?;
    batch
        .validate(&criteria)
        .context("failed to validate deposit data")?;
    batch
        .verify(&BlsVerifier)
        .context("failed to verify deposit data")?;

    info!(deposit_count = batch.len(), "Deposit data verified");
    writeln!(out, "✅ Successfully verified {} deposits", batch.len())?;
    writeln!(out, "{batch}")?;
    Ok(())
}

fn voluntary_exits(args: VoluntaryExitsArgs) -> Result<()> {
    let registry = ExitRegistry::load(
        &args.input,
        &args.network,
        &args.withdrawal_credentials,
        &pubkey_set(&args.pubkeys),
    )
    .context("failed to load exits")?;

    registry
        .validate_count(args.count)
        .context("failed to check exit count")?;

    if !args.skip_index_mismatch_check {
        registry
            .validate_indices()
            .context("failed to check exit indices")?;
    }

    let summary = registry
        .verify(&BlsVerifier)
        .context("failed to verify exits")?;

    if !args.skip_check_message {
        info!(
            first_validator_index = summary.first_index,
            last_validator_index = summary.last_index,
            network = %args.network,
            "Please check that the latest live validator index sits between these values."
        );
        info!(
            "You can use a command like this to check the current highest finalized validator index: \n\n\
             curl -H \"Content-Type: application/json\" http://localhost:5052/eth/v1/beacon/states/finalized/validators | jq -r '[.data[].index | tonumber] | max' \n"
        );
    }

    println!(
        "✅ Successfully verified {} sets of validator exits",
        registry.len()
    );
    Ok(())
}
