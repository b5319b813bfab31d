use aggregator::{
    archive::{ArchiveReader, HttpArchive},
    ledger::{HttpLedger, Ledger},
    metrics::Metrics,
    reconcile::{ReconciliationReport, Reconciler, ReconcilerConfig},
};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{error, info, warn};
use openvote_cli::{utils::*, BatchFile, InclusionProof};
use openvote_core::{verify, Digest, ReconciliationStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;

#[derive(Clone, Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, env, default_value = "http://localhost:3001")]
    pub archive_url: String,

    #[arg(long, env, default_value = "http://localhost:3001/dev-ledger")]
    pub ledger_url: String,

    #[arg(long, env, default_value = "10000", help = "HTTP timeout in milliseconds")]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Clone)]
pub enum Commands {
    /// Recompute a batch root from a batch file
    Root {
        #[arg(long, env, help = "Path to read the batch file")]
        read_path: PathBuf,

        #[arg(long, default_value = "false")]
        is_compressed: bool,
    },
    /// Build an inclusion proof for one record of a batch file
    Prove {
        #[arg(long, env, help = "Path to read the batch file")]
        read_path: PathBuf,

        #[arg(long, default_value = "false")]
        is_compressed: bool,

        #[arg(long, help = "Dedup key of the record to prove")]
        dedup_key: String,

        #[arg(long, help = "Where to write the proof JSON (stdout if omitted)")]
        save_path: Option<PathBuf>,
    },
    /// Check an inclusion proof against a root
    Verify {
        #[arg(long, help = "Proof JSON written by `prove`")]
        proof_path: PathBuf,

        #[arg(long, value_parser = parse_digest, help = "Root to check against, hex. Defaults to the root in the proof file.")]
        root: Option<Digest>,

        #[arg(long, help = "Take the root from the ledger for this batch id")]
        ledger_batch_id: Option<u64>,
    },
    /// Download an archived batch
    Fetch {
        #[arg(long, help = "Ledger batch id")]
        id: u64,

        #[arg(long, help = "Path to save the batch file")]
        save_path: PathBuf,

        #[arg(long, default_value = "false")]
        compress: bool,
    },
    /// Reconcile ledger roots against archived batches
    Audit {
        #[arg(long, help = "Only this ledger batch id")]
        id: Option<u64>,
    },
}

fn main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(false)
        .try_init();

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    match cli.command {
        Commands::Root {
            ref read_path,
            is_compressed,
        } => {
            let batch = BatchFile::read(read_path, is_compressed)?;
            let root = batch.compute_root();
            info!("Records: {}", batch.records.len());
            info!("Hash version: {}", batch.hash_version.as_str());
            if let Some(claimed) = batch.root {
                if claimed != root {
                    warn!("File claims root {} but records hash to {}", claimed, root);
                }
            }
            println!("{}", root);
        }
        Commands::Prove {
            ref read_path,
            is_compressed,
            ref dedup_key,
            ref save_path,
        } => {
            let batch = BatchFile::read(read_path, is_compressed)?;
            let proof = InclusionProof::build(&batch, dedup_key)
                .ok_or_else(|| anyhow!("No record with dedup key {:?}", dedup_key))?;
            info!(
                "Proof for {:?}: leaf {}, {} steps, root {}",
                dedup_key,
                proof.leaf,
                proof.proof.len(),
                proof.root
            );

            let json = serde_json::to_string_pretty(&proof)?;
            match save_path {
                Some(path) => {
                    std::fs::write(path, json)?;
                    info!("Proof saved to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Verify {
            ref proof_path,
            root,
            ledger_batch_id,
        } => {
            let proof = InclusionProof::read(proof_path)?;
            let root = match (root, ledger_batch_id) {
                (Some(root), _) => root,
                (None, Some(id)) => {
                    let ledger = HttpLedger::new(cli.ledger_url.clone(), timeout)?;
                    runtime
                        .block_on(ledger.committed_root(id))?
                        .ok_or_else(|| anyhow!("Ledger has no root for batch {}", id))?
                }
                (None, None) => {
                    warn!("No --root or --ledger-batch-id given, checking against the root in the proof file");
                    proof.root
                }
            };

            if verify(&proof.proof, &proof.leaf, &root) {
                info!("Proof VALID: {} is included under root {}", proof.leaf, root);
            } else {
                error!("Proof INVALID against root {}", root);
                std::process::exit(1);
            }
        }
        Commands::Fetch {
            id,
            ref save_path,
            compress,
        } => {
            let archive = HttpArchive::new(cli.archive_url.clone(), timeout)?;
            let batch = runtime
                .block_on(archive.fetch(id))?
                .ok_or_else(|| anyhow!("Archive has no batch {}", id))?;
            let file = BatchFile::from(batch);
            file.save(save_path, compress)?;
            info!(
                "Saved ledger batch {} ({} records) to {}",
                id,
                file.records.len(),
                save_path.display()
            );
        }
        Commands::Audit { id } => {
            let ledger = Arc::new(HttpLedger::new(cli.ledger_url.clone(), timeout)?);
            let archive = Arc::new(HttpArchive::new(cli.archive_url.clone(), timeout)?);
            let report = ReconciliationReport::new();
            let reconciler = Reconciler::new(
                ledger,
                archive,
                report.clone(),
                Arc::new(Metrics::new()),
                ReconcilerConfig::default(),
            );

            match id {
                Some(id) => {
                    runtime.block_on(reconciler.reconcile(id))?;
                }
                None => {
                    let checked = runtime.block_on(reconciler.pass())?;
                    info!("Checked {} ledger batches", checked);
                }
            }

            for result in report.results() {
                println!(
                    "{}\t{}\t{}",
                    result.ledger_batch_id,
                    result.status,
                    result.expected_root
                );
            }
            let mismatched = report
                .results()
                .iter()
                .filter(|r| r.status == ReconciliationStatus::Mismatch)
                .count();
            if mismatched > 0 {
                bail!("{} ledger batches do not match their archived data", mismatched);
            }
        }
    }

    Ok(())
}
