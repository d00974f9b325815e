//! Validator Tools
//!
//! Verifies deposit data and voluntary exits, generates exits in bulk through
//! `ethdo`, and extracts the exits matching live validator indices.

mod extract;
mod generate;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use validator_core::{parse_hex_fixed, BeaconClient, BlsPubkey, HexError};

#[derive(Parser, Debug)]
#[command(name = "validator-tools")]
#[command(about = "Runs validator tools.")]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify deposit data or voluntary exits
    #[command(subcommand)]
    Verify(verify::VerifyCommand),

    /// Generate validator messages
    #[command(subcommand)]
    Generate(generate::GenerateCommand),

    /// Extract voluntary exits for live validator indices
    #[command(subcommand)]
    Extract(extract::ExtractCommand),

    /// Print the version of validator tools
    Version,
}

/// Parse 32 bytes of withdrawal credentials
fn parse_credentials(s: &str) -> Result<[u8; 32], HexError> {
    parse_hex_fixed(s)
}

/// Collect pubkeys given on the command line, dropping duplicates
fn pubkey_set(pubkeys: &[BlsPubkey]) -> BTreeSet<BlsPubkey> {
    pubkeys.iter().copied().collect()
}

/// Beacon client with the long request timeout full validator listings need
fn beacon_client(url: &str) -> Result<BeaconClient> {
    let client = reqwest::Client::builder()
        .timeout(BeaconClient::DEFAULT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    Ok(BeaconClient::with_client(url, client))
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Verify(cmd) => verify::run(cmd),
        Command::Generate(cmd) => generate::run(cmd).await,
        Command::Extract(cmd) => extract::run(cmd).await,
        Command::Version => {
            println!(
                "Version: {}\nOS/Arch: {}/{}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pubkeys_split_on_commas() {
        let a = "aa".repeat(48);
        let b = format!("0x{}", "bb".repeat(48));
        let cli = Cli::try_parse_from([
            "validator-tools",
            "verify",
            "voluntary-exits",
            "--input",
            "exits",
            "--network",
            "holesky",
            "--withdrawal-credentials",
            "0x01",
            "--pubkeys",
            &format!("{a},{b}"),
        ])
        .unwrap();

        let Command::Verify(verify::VerifyCommand::VoluntaryExits(args)) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(
            pubkey_set(&args.pubkeys),
            BTreeSet::from([BlsPubkey([0xaa; 48]), BlsPubkey([0xbb; 48])])
        );
        assert_eq!(args.count, 0);
        assert!(!args.skip_index_mismatch_check);
    }

    #[test]
    fn test_generate_defaults() {
        let cli = Cli::try_parse_from([
            "validator-tools",
            "generate",
            "voluntary-exits",
            "--input",
            "keys",
            "--output",
            "exits",
            "--withdrawal-credentials",
            &"11".repeat(32),
            "--passphrase",
            "pw",
            "--beacon",
            "http://localhost:5052",
        ])
        .unwrap();

        let Command::Generate(generate::GenerateCommand::VoluntaryExits(args)) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(args.count, 50_000);
        assert_eq!(args.prefix, "keystore-");
        assert_eq!(args.index_start, None);
        assert_eq!(args.withdrawal_credentials, [0x11; 32]);
    }

    #[test]
    fn test_deposit_amount_defaults_to_32_eth() {
        let cli = Cli::try_parse_from([
            "validator-tools",
            "verify",
            "deposit-data",
            "--deposit-data",
            "deposit_data.json",
        ])
        .unwrap();

        let Command::Verify(verify::VerifyCommand::DepositData(args)) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(args.amount, 32_000_000_000);
        assert!(args.withdrawal_credentials.is_none());
    }
}
