//! Generate exits with an in-process BLS signer, then load, range-check and
//! verify them exactly as the verifier does for `ethdo` output.

use blst::min_pk::SecretKey;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use validator_core::ethdo::{SignerError, PREPARATION_FILE};
use validator_core::exit_file::SignedVoluntaryExitJson;
use validator_core::exits::ExitError;
use validator_core::generator::{discover_keystores, PreparationContext};
use validator_core::signing::{compute_domain, compute_signing_root, hash_tree_root, VoluntaryExit, BLS_DST};
use validator_core::{
    BlsPubkey, BlsSignature, BlsVerifier, ChainSpec, ExitGenerator, ExitRegistry, ExitSigner,
    GeneratorConfig,
};

const WC: &str = "0x0100000000000000000000002222222222222222222222222222222222222222";

/// Signs from the preparation file with keys held in memory, keyed by
/// keystore path.
struct InMemorySigner {
    keys: HashMap<PathBuf, SecretKey>,
}

impl InMemorySigner {
    fn sign(&self, keystore: &Path, work_dir: &Path) -> Result<Vec<u8>, String> {
        let sk = self
            .keys
            .get(keystore)
            .ok_or_else(|| format!("unknown keystore {}", keystore.display()))?;
        let raw = std::fs::read(work_dir.join(PREPARATION_FILE)).map_err(|e| e.to_string())?;
        let prep: PreparationContext = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;

        let exit = VoluntaryExit {
            epoch: prep.network.epoch,
            validator_index: prep.validators[0].index,
        };
        let domain = compute_domain(
            prep.network.voluntary_exit_domain_type,
            prep.network.exit_fork_version,
            prep.network.genesis_validators_root,
        )
        .map_err(|e| e.to_string())?;
        let root = compute_signing_root(hash_tree_root(&exit).map_err(|e| e.to_string())?, domain)
            .map_err(|e| e.to_string())?;
        let signature = BlsSignature(sk.sign(&root, BLS_DST, &[]).to_bytes());

        serde_json::to_vec(&SignedVoluntaryExitJson::new(&exit, &signature)).map_err(|e| e.to_string())
    }
}

impl ExitSigner for InMemorySigner {
    async fn sign_exit(&self, keystore: &Path, work_dir: &Path) -> Result<Vec<u8>, SignerError> {
        self.sign(keystore, work_dir).map_err(SignerError::Other)
    }
}

struct Fleet {
    keys_dir: tempfile::TempDir,
    signer: InMemorySigner,
    pubkeys: BTreeSet<BlsPubkey>,
}

fn fleet(seeds: &[u8]) -> Fleet {
    let keys_dir = tempfile::tempdir().unwrap();
    let mut keys = HashMap::new();
    let mut pubkeys = BTreeSet::new();

    for (i, seed) in seeds.iter().enumerate() {
        let sk = SecretKey::key_gen(&[*seed; 32], &[]).unwrap();
        let pubkey = BlsPubkey(sk.sk_to_pk().to_bytes());
        let path = keys_dir.path().join(format!("keystore-m_12381_3600_{i}_0_0.json"));
        let body = serde_json::json!({ "crypto": {}, "pubkey": hex::encode(pubkey.as_bytes()), "version": 4 });
        std::fs::write(&path, body.to_string()).unwrap();

        keys.insert(std::path::absolute(&path).unwrap(), sk);
        pubkeys.insert(pubkey);
    }

    Fleet {
        keys_dir,
        signer: InMemorySigner { keys },
        pubkeys,
    }
}

async fn generate(fleet: Fleet, out: &Path, iterations: u64, start: u64) -> BTreeSet<BlsPubkey> {
    let config = GeneratorConfig {
        output_dir: out.to_path_buf(),
        withdrawal_credentials: validator_core::parse_hex_fixed(WC).unwrap(),
        iterations,
        num_workers: 3,
        ..GeneratorConfig::default()
    };
    let generator = ExitGenerator::new(
        config,
        ChainSpec::for_network("holesky").unwrap().network_config(),
        fleet.signer,
    )
    .unwrap();

    let keystores = discover_keystores(fleet.keys_dir.path(), "keystore-").unwrap();
    generator.run(&keystores, start).await.unwrap();
    fleet.pubkeys
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generated_exits_pass_verification() {
    let out = tempfile::tempdir().unwrap();
    let pubkeys = generate(fleet(&[11, 12]), out.path(), 20, 1_000).await;

    let registry = ExitRegistry::load(out.path(), "holesky", WC, &pubkeys).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.exit_count(), 40);

    registry.validate_count(20).unwrap();
    registry.validate_indices().unwrap();
    let summary = registry.verify(&BlsVerifier).unwrap();
    assert_eq!((summary.first_index, summary.last_index), (1_001, 1_020));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verification_detects_removed_exit() {
    let out = tempfile::tempdir().unwrap();
    let pubkeys = generate(fleet(&[21]), out.path(), 10, 0).await;
    let pubkey = *pubkeys.iter().next().unwrap();

    std::fs::remove_file(out.path().join(format!("5-{pubkey}.json"))).unwrap();

    let registry = ExitRegistry::load(out.path(), "holesky", WC, &pubkeys).unwrap();
    assert!(matches!(
        registry.validate_count(10),
        Err(ExitError::Gap { found: 9, total: 10, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verification_rejects_wrong_network() {
    let out = tempfile::tempdir().unwrap();
    let pubkeys = generate(fleet(&[31]), out.path(), 3, 0).await;

    let registry = ExitRegistry::load(out.path(), "hoodi", WC, &pubkeys).unwrap();
    assert!(matches!(
        registry.verify(&BlsVerifier),
        Err(ExitError::Verification { validator_index: 1, .. })
    ));
}
