use std::collections::HashSet;
use std::time::{Duration, Instant};

use aggregator::archive::ArchiveReader;
use aggregator::ledger::Ledger;
use openvote_cli::{BatchFile, InclusionProof};
use openvote_core::{verify, BatchState, ReconciliationStatus, SealTrigger};
use tokio::task::JoinSet;

use crate::utils::harness::{temp_db_path, TestContext};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_intake_to_reconciled_proofs() {
    let ctx = TestContext::start(10, Duration::from_secs(60)).await;

    // 25 voters at once: two full batches by size, five left pending
    let mut tasks = JoinSet::new();
    for i in 0..25 {
        let accumulator = ctx.accumulator.clone();
        tasks.spawn(async move {
            accumulator
                .submit(crate::utils::harness::record(&format!("voter-{:02}", i)))
                .await
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    ctx.wait_for_state(1, BatchState::Archived).await;
    ctx.wait_for_state(2, BatchState::Archived).await;
    assert_eq!(ctx.accumulator.status().await.unwrap().pending, 5);

    let forced = ctx.accumulator.force_seal().await.unwrap();
    assert_eq!(forced.local_id, 3);
    assert_eq!(forced.trigger, SealTrigger::Forced);
    ctx.wait_for_state(3, BatchState::Archived).await;

    // Every voter in exactly one batch
    let mut seen = HashSet::new();
    let mut sizes = Vec::new();
    for local_id in 1..=3 {
        let batch = ctx.store.get(local_id).await.unwrap().unwrap();
        sizes.push(batch.len());
        for r in &batch.records {
            assert!(seen.insert(r.dedup_key.clone()), "{} sealed twice", r.dedup_key);
        }
    }
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(seen.len(), 25);

    // Reconciliation over all ledger batches
    assert_eq!(ctx.reconciler.pass().await.unwrap(), 3);
    let counts = ctx.report.counts();
    assert_eq!(counts.matched, 3);
    assert_eq!(counts.mismatched, 0);

    // Any voter can prove inclusion from the archive against the ledger root
    for ledger_batch_id in 1..=3 {
        let archived = ctx.archive.fetch(ledger_batch_id).await.unwrap().unwrap();
        let committed = ctx
            .ledger
            .committed_root(ledger_batch_id)
            .await
            .unwrap()
            .unwrap();
        let file = BatchFile::from(archived);
        assert_eq!(file.compute_root(), committed);

        for r in &file.records {
            let proof = InclusionProof::build(&file, &r.dedup_key).unwrap();
            assert!(verify(&proof.proof, &proof.leaf, &committed));
        }
    }

    // A proof from one batch does not verify against another batch's root
    let first = BatchFile::from(ctx.archive.fetch(1).await.unwrap().unwrap());
    let proof = InclusionProof::build(&first, &first.records[0].dedup_key).unwrap();
    let other_root = ctx.ledger.committed_root(2).await.unwrap().unwrap();
    assert!(!verify(&proof.proof, &proof.leaf, &other_root));

    ctx.stop().await;
}

#[tokio::test]
async fn interval_seals_a_partial_batch() {
    let interval = Duration::from_millis(300);
    let ctx = TestContext::start(100, interval).await;

    let started = Instant::now();
    for voter in ["ana", "ben", "cat"] {
        ctx.submit(voter).await.unwrap();
    }
    // Not before the interval
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.store.get(1).await.unwrap().is_none());

    let batch = ctx.wait_for_state(1, BatchState::Archived).await;
    assert!(started.elapsed() >= interval);
    assert_eq!(batch.trigger, SealTrigger::Timer);
    assert_eq!(batch.len(), 3);

    let result = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Match);

    ctx.stop().await;
}

#[tokio::test]
async fn restart_keeps_pending_records() {
    let path = temp_db_path("restart");
    let db = aggregator::database::Database::connect(&path).await.unwrap();
    let ctx = TestContext::start_on(db, 10, Duration::from_secs(60)).await;
    for voter in ["d1", "d2", "d3", "d4"] {
        ctx.submit(voter).await.unwrap();
    }
    let db = ctx.stop().await;
    db.pool().close().await;

    let db = aggregator::database::Database::connect(&path).await.unwrap();
    let ctx = TestContext::start_on(db, 10, Duration::from_secs(60)).await;
    let status = ctx.accumulator.status().await.unwrap();
    assert_eq!(status.local_id, 1);
    assert_eq!(status.pending, 4);

    // Voters accepted before the restart stay accepted
    assert!(ctx.submit("d2").await.is_err());

    let batch = ctx.accumulator.force_seal().await.unwrap();
    assert_eq!(batch.len(), 4);
    ctx.wait_for_state(1, BatchState::Archived).await;

    ctx.stop().await;
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{}-wal", path));
    let _ = std::fs::remove_file(format!("{}-shm", path));
}
