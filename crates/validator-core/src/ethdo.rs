//! External Exit Signer
//!
//! [`ExitSigner`] signs one voluntary exit from a keystore, reading the
//! offline preparation file from its working directory. [`EthdoSigner`] does
//! this by running `ethdo validator exit --offline`.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// File name the signer reads network and validator data from
pub const PREPARATION_FILE: &str = "offline-preparation.json";

/// Errors from invoking the signer
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("signer exited with {status}: {output}")]
    Failed { status: ExitStatus, output: String },

    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Produces a signed voluntary exit for a keystore.
pub trait ExitSigner: Send + Sync + 'static {
    /// Sign the exit described by [`PREPARATION_FILE`] in `work_dir` with the
    /// key in `keystore`, returning the signer's output verbatim.
    fn sign_exit(
        &self,
        keystore: &Path,
        work_dir: &Path,
    ) -> impl Future<Output = Result<Vec<u8>, SignerError>> + Send;

    /// Check the signer can be used before any work is dispatched.
    fn probe(&self) -> impl Future<Output = Result<(), SignerError>> + Send {
        async { Ok(()) }
    }
}

/// [`ExitSigner`] backed by the `ethdo` binary
#[derive(Clone)]
pub struct EthdoSigner {
    binary: PathBuf,
    passphrase: String,
}

impl EthdoSigner {
    /// Binary looked up on `PATH` when none is configured
    pub const DEFAULT_BINARY: &'static str = "ethdo";

    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            passphrase: passphrase.into(),
        }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn exit_args(&self, keystore: &Path) -> Vec<String> {
        vec![
            "validator".to_string(),
            "exit".to_string(),
            format!("--validator={}", keystore.display()),
            format!("--passphrase={}", self.passphrase),
            "--json".to_string(),
            "--offline".to_string(),
        ]
    }
}

impl fmt::Debug for EthdoSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EthdoSigner")
            .field("binary", &self.binary)
            .field("passphrase", &"********")
            .finish()
    }
}

/// Command line with `--passphrase=` values masked
#[must_use]
pub fn redact_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.starts_with("--passphrase=") {
                "--passphrase=********"
            } else {
                arg.as_str()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl ExitSigner for EthdoSigner {
    async fn sign_exit(&self, keystore: &Path, work_dir: &Path) -> Result<Vec<u8>, SignerError> {
        let args = self.exit_args(keystore);
        debug!(
            command = %format!("{} {}", self.binary.display(), redact_args(&args)),
            work_dir = %work_dir.display(),
            "Running signer"
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SignerError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let status = output.status;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !status.success() {
            let output = String::from_utf8_lossy(&combined).trim().to_string();
            error!(%status, output = %output, "ethdo command failed");
            return Err(SignerError::Failed { status, output });
        }

        Ok(combined)
    }

    async fn probe(&self) -> Result<(), SignerError> {
        let output = Command::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map_err(|source| SignerError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(SignerError::Unavailable(format!(
                "{} version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        debug!(
            binary = %self.binary.display(),
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Signer available"
        );
        Ok(())
    }
}
