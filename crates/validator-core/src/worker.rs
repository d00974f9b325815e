//! Exit Generation Worker Pool
//!
//! A closed, prefilled task queue drained by a fixed number of workers. Each
//! worker owns a temporary directory for its lifetime, writes the preparation
//! file there and invokes the signer once per task. A worker stops at its
//! first failure; the others keep draining the queue. Errors are collected
//! after every worker has joined.

use crate::ethdo::{ExitSigner, PREPARATION_FILE};
use crate::exit_file::ExitFileName;
use crate::generator::{GenerationError, PreparationContext};
use crate::network::NetworkConfig;
use crate::types::BlsPubkey;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One exit to generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitTask {
    /// Target validator index
    pub validator_index: u64,
    /// Pubkey read from the keystore
    pub pubkey: BlsPubkey,
    /// Absolute keystore path
    pub keystore_path: PathBuf,
}

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenerationPhase {
    Idle = 0,
    Resolving = 1,
    Dispatching = 2,
    Running = 3,
    Draining = 4,
    Completed = 5,
    Failed = 6,
}

impl GenerationPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Resolving,
            2 => Self::Dispatching,
            3 => Self::Running,
            4 => Self::Draining,
            5 => Self::Completed,
            6 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Shared progress counters. Report-only: nothing reads them to decide
/// control flow.
#[derive(Debug, Clone, Default)]
pub struct GenerationProgress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    /// Keystores in this run
    total_keystores: AtomicU32,
    /// Ordinal of the keystore being processed
    current_keystore: AtomicU32,
    /// Tasks finished for the current keystore
    completed: AtomicU64,
    /// Tasks queued for the current keystore
    total_tasks: AtomicU64,
    /// Progress lines emitted by the reporter
    reports: AtomicU64,
    phase: AtomicU8,
}

impl GenerationProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn total_keystores(&self) -> u32 {
        self.inner.total_keystores.load(Ordering::Relaxed)
    }

    pub fn set_total_keystores(&self, total: u32) {
        self.inner.total_keystores.store(total, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_keystore(&self) -> u32 {
        self.inner.current_keystore.load(Ordering::Relaxed)
    }

    /// Advance to the next keystore and return its 1-based ordinal
    pub fn next_keystore(&self) -> u32 {
        self.inner.current_keystore.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the task counters for a new batch
    pub fn start_batch(&self, total_tasks: u64) {
        self.inner.completed.store(0, Ordering::Relaxed);
        self.inner.total_tasks.store(total_tasks, Ordering::Relaxed);
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn record_completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Progress lines emitted so far
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.inner.reports.load(Ordering::Relaxed)
    }

    fn emit_report(&self) {
        self.inner.reports.fetch_add(1, Ordering::Relaxed);
        info!("{}", self.progress_line());
    }

    #[must_use]
    pub fn phase(&self) -> GenerationPhase {
        GenerationPhase::from_u8(self.inner.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, phase: GenerationPhase) {
        debug!(?phase, "Generation phase");
        self.inner.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// `Progress: Keystore k/N - c/I exits generated (x%)`
    #[must_use]
    pub fn progress_line(&self) -> String {
        let completed = self.completed();
        let total = self.inner.total_tasks.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let percent = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        format!(
            "Progress: Keystore {}/{} - {completed}/{total} exits generated ({percent:.1}%)",
            self.current_keystore(),
            self.total_keystores(),
        )
    }
}

/// What every worker needs besides its task
#[derive(Debug)]
pub struct WorkerContext<S> {
    pub signer: Arc<S>,
    pub network: NetworkConfig,
    pub withdrawal_credentials: [u8; 32],
    pub output_dir: PathBuf,
}

impl<S: ExitSigner> WorkerContext<S> {
    async fn process(
        &self,
        worker: usize,
        work_dir: &Path,
        task: &ExitTask,
    ) -> Result<PathBuf, GenerationError> {
        let preparation =
            PreparationContext::for_task(task, self.withdrawal_credentials, &self.network);
        let preparation_path = work_dir.join(PREPARATION_FILE);
        tokio::fs::write(&preparation_path, serde_json::to_vec_pretty(&preparation)?)
            .await
            .map_err(|source| GenerationError::Io {
                path: preparation_path.clone(),
                source,
            })?;

        let output = self
            .signer
            .sign_exit(&task.keystore_path, work_dir)
            .await
            .map_err(|source| GenerationError::Signer {
                worker,
                validator_index: task.validator_index,
                source,
            })?;

        let out_path = self
            .output_dir
            .join(ExitFileName::for_exit(task.validator_index, task.pubkey).to_string());
        tokio::fs::write(&out_path, output)
            .await
            .map_err(|source| GenerationError::Io {
                path: out_path.clone(),
                source,
            })?;

        Ok(out_path)
    }
}

/// Run `tasks` on `num_workers` workers and wait for all of them.
///
/// # Errors
/// Returns the first error any worker recorded, after every worker joined.
pub async fn run_pool<S: ExitSigner>(
    ctx: Arc<WorkerContext<S>>,
    tasks: Vec<ExitTask>,
    num_workers: usize,
    progress: &GenerationProgress,
    progress_interval: Duration,
) -> Result<(), GenerationError> {
    if num_workers == 0 {
        return Err(GenerationError::InvalidWorkerCount);
    }

    let (task_tx, task_rx) = mpsc::channel(tasks.len().max(1));
    for task in tasks {
        task_tx
            .send(task)
            .await
            .map_err(|_| GenerationError::QueueClosed)?;
    }
    drop(task_tx);
    // Draining once the last task has been pulled
    progress.set_phase(if task_rx.is_empty() {
        GenerationPhase::Draining
    } else {
        GenerationPhase::Running
    });
    let task_rx = Arc::new(Mutex::new(task_rx));

    // One slot per worker: each worker reports at most one error.
    let (err_tx, mut err_rx) = mpsc::channel(num_workers);

    let (stop_tx, stop_rx) = oneshot::channel();
    let reporter = tokio::spawn(report_progress(
        progress.clone(),
        progress_interval,
        stop_rx,
    ));

    let handles: Vec<_> = (0..num_workers)
        .map(|id| {
            tokio::spawn(
                worker(
                    id,
                    Arc::clone(&ctx),
                    Arc::clone(&task_rx),
                    err_tx.clone(),
                    progress.clone(),
                )
                .instrument(info_span!("worker", id)),
            )
        })
        .collect();
    drop(err_tx);

    let mut join_error = None;
    for (id, handle) in handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!(worker = id, error = %e, "Worker task failed");
            join_error.get_or_insert(GenerationError::WorkerPanicked {
                worker: id,
                reason: e.to_string(),
            });
        }
    }

    let _ = stop_tx.send(());
    if let Err(e) = reporter.await {
        warn!(error = %e, "Progress reporter failed");
    }

    let mut first_error = None;
    while let Ok(e) = err_rx.try_recv() {
        error!(error = %e, "Worker error encountered");
        first_error.get_or_insert(e);
    }

    match first_error.or(join_error) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn worker<S: ExitSigner>(
    id: usize,
    ctx: Arc<WorkerContext<S>>,
    tasks: Arc<Mutex<mpsc::Receiver<ExitTask>>>,
    errors: mpsc::Sender<GenerationError>,
    progress: GenerationProgress,
) {
    let work_dir = match tempfile::Builder::new()
        .prefix(&format!("ethdo-worker-{id}-"))
        .tempdir()
    {
        Ok(dir) => dir,
        Err(source) => {
            report(
                &errors,
                GenerationError::Io {
                    path: std::env::temp_dir(),
                    source,
                },
            )
            .await;
            return;
        }
    };
    debug!(work_dir = %work_dir.path().display(), "Worker started");

    loop {
        let next = {
            let mut queue = tasks.lock().await;
            let next = queue.recv().await;
            if next.is_some() && queue.is_empty() {
                progress.set_phase(GenerationPhase::Draining);
            }
            next
        };
        let Some(task) = next else {
            break;
        };

        debug!(validator_index = task.validator_index, "Processing validator index");
        match ctx.process(id, work_dir.path(), &task).await {
            Ok(path) => {
                progress.record_completed();
                debug!(
                    validator_index = task.validator_index,
                    output = %path.display(),
                    "Completed validator index"
                );
            }
            Err(e) => {
                error!(validator_index = task.validator_index, error = %e, "Task failed");
                report(&errors, e).await;
                break;
            }
        }
    }

    debug!("Worker finished");
}

async fn report(errors: &mpsc::Sender<GenerationError>, error: GenerationError) {
    if let Err(e) = errors.send(error).await {
        warn!(error = %e.0, "Error channel closed");
    }
}

async fn report_progress(
    progress: GenerationProgress,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let period = period.max(Duration::from_millis(100));
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => progress.emit_report(),
            _ = &mut stop => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethdo::SignerError;
    use crate::network::ChainSpec;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    /// Echoes the preparation file back; fails for one index
    #[derive(Default)]
    struct EchoSigner {
        fail_index: Option<u64>,
        work_dirs: StdMutex<BTreeSet<PathBuf>>,
    }

    impl ExitSigner for EchoSigner {
        async fn sign_exit(&self, _keystore: &Path, work_dir: &Path) -> Result<Vec<u8>, SignerError> {
            self.work_dirs
                .lock()
                .unwrap()
                .insert(work_dir.to_path_buf());
            let raw = std::fs::read(work_dir.join(PREPARATION_FILE)).unwrap();
            let prep: PreparationContext = serde_json::from_slice(&raw).unwrap();
            if Some(prep.validators[0].index) == self.fail_index {
                return Err(SignerError::Other("refused".to_string()));
            }
            Ok(raw)
        }
    }

    fn tasks(range: std::ops::RangeInclusive<u64>) -> Vec<ExitTask> {
        range
            .map(|validator_index| ExitTask {
                validator_index,
                pubkey: BlsPubkey([7; 48]),
                keystore_path: PathBuf::from("/keys/keystore-0.json"),
            })
            .collect()
    }

    fn context<S: ExitSigner>(signer: S, output_dir: &Path) -> Arc<WorkerContext<S>> {
        Arc::new(WorkerContext {
            signer: Arc::new(signer),
            network: ChainSpec::for_network("holesky").unwrap().network_config(),
            withdrawal_credentials: [1; 32],
            output_dir: output_dir.to_path_buf(),
        })
    }

    fn output_names(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_progress_line() {
        let progress = GenerationProgress::new();
        progress.set_total_keystores(3);
        progress.next_keystore();
        progress.next_keystore();
        progress.start_batch(8);
        for _ in 0..2 {
            progress.record_completed();
        }
        assert_eq!(
            progress.progress_line(),
            "Progress: Keystore 2/3 - 2/8 exits generated (25.0%)"
        );
    }

    #[test]
    fn test_phase_round_trips() {
        let progress = GenerationProgress::new();
        assert_eq!(progress.phase(), GenerationPhase::Idle);
        progress.set_phase(GenerationPhase::Draining);
        assert_eq!(progress.phase(), GenerationPhase::Draining);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let out = tempfile::tempdir().unwrap();
        let err = run_pool(
            context(EchoSigner::default(), out.path()),
            tasks(1..=3),
            0,
            &GenerationProgress::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidWorkerCount));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_writes_one_file_per_task_and_cleans_up() {
        let out = tempfile::tempdir().unwrap();
        let ctx = context(EchoSigner::default(), out.path());
        let progress = GenerationProgress::new();
        progress.start_batch(20);

        run_pool(Arc::clone(&ctx), tasks(1..=20), 4, &progress, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(output_names(out.path()).len(), 20);
        assert_eq!(progress.completed(), 20);

        let work_dirs = ctx.signer.work_dirs.lock().unwrap().clone();
        assert!(!work_dirs.is_empty() && work_dirs.len() <= 4);
        for dir in work_dirs {
            let name = dir.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("ethdo-worker-"), "{name}");
            assert!(!dir.exists(), "{} was not removed", dir.display());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_reported_after_other_workers_drain() {
        let out = tempfile::tempdir().unwrap();
        let signer = EchoSigner {
            fail_index: Some(5),
            ..EchoSigner::default()
        };
        let progress = GenerationProgress::new();

        let err = run_pool(
            context(signer, out.path()),
            tasks(1..=10),
            2,
            &progress,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::Signer {
                validator_index: 5,
                ..
            }
        ));

        // The surviving worker drains everything the failed one did not pull.
        let written = output_names(out.path());
        assert_eq!(written.len(), 9);
        assert!(!written.iter().any(|name| name.starts_with("5-")));
        assert_eq!(progress.completed(), 9);
    }

    #[tokio::test]
    async fn test_preparation_file_layout() {
        let out = tempfile::tempdir().unwrap();
        run_pool(
            context(EchoSigner::default(), out.path()),
            tasks(42..=42),
            1,
            &GenerationProgress::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let name = ExitFileName::for_exit(42, BlsPubkey([7; 48])).to_string();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.path().join(name)).unwrap()).unwrap();

        assert_eq!(written["version"], "3");
        assert_eq!(written["validators"][0]["index"], "42");
        assert_eq!(written["validators"][0]["state"], "active_ongoing");
        assert_eq!(
            written["validators"][0]["pubkey"],
            format!("0x{}", "07".repeat(48))
        );
        assert_eq!(
            written["validators"][0]["withdrawal_credentials"],
            format!("0x{}", "01".repeat(32))
        );
        assert_eq!(written["epoch"], "256");
        assert_eq!(written["exit_fork_version"], "0x04017000");
        assert_eq!(
            written["genesis_validators_root"],
            "0x9143aa7c615a7f7115e2b6aac319c03529df8242ae705fba9df39b79c59fa8b1"
        );
    }

    /// Holds every signature until a permit is released
    struct GatedSigner {
        gate: Arc<tokio::sync::Semaphore>,
    }

    impl ExitSigner for GatedSigner {
        async fn sign_exit(&self, _keystore: &Path, work_dir: &Path) -> Result<Vec<u8>, SignerError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| SignerError::Other(e.to_string()))?
                .forget();
            std::fs::read(work_dir.join(PREPARATION_FILE)).map_err(|e| SignerError::Other(e.to_string()))
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_ticks_while_running_and_stops_after_join() {
        let out = tempfile::tempdir().unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let ctx = context(
            GatedSigner {
                gate: Arc::clone(&gate),
            },
            out.path(),
        );
        let progress = GenerationProgress::new();
        progress.start_batch(2);

        let observe = async {
            tokio::time::sleep(Duration::from_secs(25)).await;
            settle().await;
            let snapshot = (progress.phase(), progress.completed(), progress.reports());
            gate.add_permits(2);
            snapshot
        };
        let (result, (phase, completed, reports)) = tokio::join!(
            run_pool(ctx, tasks(1..=2), 1, &progress, Duration::from_secs(10)),
            observe
        );
        result.unwrap();

        // One worker holds the first task; the second is still queued.
        assert_eq!(phase, GenerationPhase::Running);
        assert_eq!(completed, 0);
        assert_eq!(reports, 2);

        assert_eq!(progress.completed(), 2);
        assert_eq!(progress.phase(), GenerationPhase::Draining);

        let after_join = progress.reports();
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(progress.reports(), after_join);
    }

    #[tokio::test]
    async fn test_empty_batch_starts_draining() {
        let out = tempfile::tempdir().unwrap();
        let progress = GenerationProgress::new();
        run_pool(
            context(EchoSigner::default(), out.path()),
            Vec::new(),
            2,
            &progress,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(progress.phase(), GenerationPhase::Draining);
        assert_eq!(progress.reports(), 0);
        assert!(output_names(out.path()).is_empty());
    }
}
