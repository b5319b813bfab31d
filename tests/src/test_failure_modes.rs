use std::time::Duration;

use aggregator::archive::{ArchiveReader, ArchiveStore};
use aggregator::ledger::Ledger;
use aggregator::pipeline::reopen_failed;
use openvote_cli::BatchFile;
use openvote_core::{
    ArchivedBatch, BatchState, CommitRequest, Digest, Error, FailureKind, HashVersion, Record,
    ReconciliationStatus,
};
use sqlx::Row;

use crate::utils::assert::assert_core_err;
use crate::utils::harness::{record, TestContext};

async fn archived_batch_of_three(ctx: &TestContext) {
    for voter in ["alice", "bob", "carol"] {
        ctx.submit(voter).await.unwrap();
    }
    ctx.wait_for_state(1, BatchState::Archived).await;
}

#[tokio::test]
async fn tampered_archive_is_a_mismatch() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;
    archived_batch_of_three(&ctx).await;

    // Flip one payload byte behind the archive's back
    let row = sqlx::query("SELECT records FROM archive WHERE ledger_batch_id = 1")
        .fetch_one(ctx.db.pool())
        .await
        .unwrap();
    let mut records: Vec<Record> = serde_json::from_str(&row.get::<String, _>("records")).unwrap();
    records[1].payload[0] ^= 0x01;
    sqlx::query("UPDATE archive SET records = ? WHERE ledger_batch_id = 1")
        .bind(serde_json::to_string(&records).unwrap())
        .execute(ctx.db.pool())
        .await
        .unwrap();

    let result = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Mismatch);
    assert_ne!(result.recomputed_root, Some(result.expected_root));
    assert!(matches!(result.as_error(), Some(Error::Mismatch { .. })));

    // The offline tool reaches the same conclusion
    let file = BatchFile::from(ctx.archive.fetch(1).await.unwrap().unwrap());
    let committed = ctx.ledger.committed_root(1).await.unwrap().unwrap();
    assert_ne!(file.compute_root(), committed);

    // Final: a later pass does not revisit it
    assert_eq!(ctx.reconciler.pass().await.unwrap(), 0);
    assert_eq!(ctx.report.counts().mismatched, 1);

    ctx.stop().await;
}

#[tokio::test]
async fn undecodable_archive_is_a_mismatch_not_missing_data() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;
    archived_batch_of_three(&ctx).await;

    // Break one base64 character so the row no longer decodes at all
    let row = sqlx::query("SELECT records FROM archive WHERE ledger_batch_id = 1")
        .fetch_one(ctx.db.pool())
        .await
        .unwrap();
    let records = row.get::<String, _>("records");
    let broken = records.replacen("\"payload\":\"", "\"payload\":\"#", 1);
    assert_ne!(broken, records);
    sqlx::query("UPDATE archive SET records = ? WHERE ledger_batch_id = 1")
        .bind(&broken)
        .execute(ctx.db.pool())
        .await
        .unwrap();

    let result = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::Mismatch);
    assert_eq!(result.recomputed_root, None);
    assert!(matches!(result.as_error(), Some(Error::Mismatch { .. })));

    assert_eq!(ctx.reconciler.pass().await.unwrap(), 0);
    let counts = ctx.report.counts();
    assert_eq!(counts.mismatched, 1);
    assert_eq!(counts.unavailable, 0);

    ctx.stop().await;
}

#[tokio::test]
async fn missing_archive_is_unavailable_until_restored() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;
    archived_batch_of_three(&ctx).await;
    let batch = ctx.store.get(1).await.unwrap().unwrap();

    sqlx::query("DELETE FROM archive WHERE ledger_batch_id = 1")
        .execute(ctx.db.pool())
        .await
        .unwrap();

    let result = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(result.status, ReconciliationStatus::DataUnavailable);
    assert_eq!(result.as_error(), Some(Error::DataUnavailable(1)));

    ctx.archive
        .store(&ArchivedBatch::from_batch(&batch, 1))
        .await
        .unwrap();
    assert_eq!(ctx.reconciler.pass().await.unwrap(), 1);
    assert_eq!(
        ctx.report.get(1).unwrap().status,
        ReconciliationStatus::Match
    );

    ctx.stop().await;
}

#[tokio::test]
async fn ledger_outage_fails_batch_until_operator_retry() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;
    ctx.ledger.set_offline(true);

    for voter in ["dan", "eve", "fay"] {
        ctx.submit(voter).await.unwrap();
    }
    let failed = ctx.wait_for_state(1, BatchState::Failed).await;
    let failure = failed.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::LedgerUnreachable);
    assert_eq!(ctx.ledger.commit_count(), 0);

    // Intake keeps working during the outage
    ctx.submit("gus").await.unwrap();

    ctx.ledger.set_offline(false);
    let reopened = reopen_failed(&ctx.store, 1).await.unwrap();
    assert_eq!(reopened.state, BatchState::Sealed);
    assert_eq!(reopened.root, failed.root);
    ctx.accumulator.handoff().send(reopened).unwrap();

    let done = ctx.wait_for_state(1, BatchState::Archived).await;
    assert_eq!(done.ledger_batch_id(), Some(1));
    assert_eq!(ctx.ledger.commit_count(), 1);
    assert_eq!(
        ctx.reconciler.reconcile(1).await.unwrap().status,
        ReconciliationStatus::Match
    );

    ctx.stop().await;
}

#[tokio::test]
async fn lost_acknowledgement_commits_once() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;
    ctx.ledger.drop_next_ack();

    archived_batch_of_three(&ctx).await;
    assert_eq!(ctx.ledger.commit_count(), 1);
    assert_eq!(ctx.ledger.latest_batch_id().await.unwrap(), Some(1));

    ctx.stop().await;
}

#[tokio::test]
async fn repeated_voter_is_stopped_at_intake_and_at_the_ledger() {
    let ctx = TestContext::start(3, Duration::from_secs(60)).await;

    ctx.submit("hal").await.unwrap();
    assert_core_err(ctx.submit("hal").await, "Intake rejected");

    // Another aggregator already committed "ivy"
    let elsewhere = CommitRequest {
        root: Digest([9u8; 32]),
        dedup_keys: vec![record("ivy").dedup_digest(HashVersion::V1)],
        submission_id: "other-aggregator-batch-1".to_string(),
        hash_version: HashVersion::V1,
    };
    ctx.ledger.commit(&elsewhere).await.unwrap();

    ctx.submit("ivy").await.unwrap();
    ctx.submit("jon").await.unwrap();
    let failed = ctx.wait_for_state(1, BatchState::Failed).await;
    assert_eq!(
        failed.failure.map(|f| f.kind),
        Some(FailureKind::LedgerRejected)
    );

    // Authoritative rejections are not retried
    assert_core_err(reopen_failed(&ctx.store, 1).await, "Invalid batch transition");
    assert_eq!(ctx.ledger.commit_count(), 1);

    ctx.stop().await;
}
