//! End-to-end scenarios exercising the full directory protocol between
//! cooperating database instances sharing one directory.

use fishtrap::{Config, Database, Error, PatchMerge};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn config(dir: &TempDir, app: Uuid, shard: Uuid) -> Config {
    let mut cfg = Config::new(app, shard);
    cfg.base_directory = dir.path().to_path_buf();
    // Scenarios drive compaction and rebase explicitly.
    cfg.compaction_interval_minutes = 0;
    cfg.check_interval_minutes = 0;
    cfg
}

async fn open_db(dir: &TempDir, app: Uuid, shard: Uuid) -> Database {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Database::new(
        config(dir, app, shard),
        json!({"something": 0, "other": []}),
        PatchMerge,
        None,
    )
    .await
    .expect("open database")
}

fn names_with_suffix(dir: &TempDir, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(suffix))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn create_update_read_reopen() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, Uuid::new_v4(), Uuid::new_v4()).await;

    db.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(db.get().await.unwrap()["something"], json!(2));

    db.close().await.unwrap();
    assert!(matches!(db.get().await, Err(Error::DatabaseClosed)));
    assert!(matches!(db.close().await, Err(Error::DatabaseClosed)));

    db.open().await.unwrap();
    assert_eq!(db.get().await.unwrap()["something"], json!(2));
}

#[tokio::test]
async fn failing_updater_leaves_state_unchanged() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, Uuid::new_v4(), Uuid::new_v4()).await;

    db.update(|doc| {
        doc["something"] = json!(1);
        Ok(())
    })
    .await
    .unwrap();

    let err = db
        .update(|doc| {
            doc["something"] = json!(99);
            anyhow::bail!("updater changed its mind")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Updater(_)));

    // The queue keeps serving, and the failed mutation left no trace.
    assert_eq!(db.get().await.unwrap()["something"], json!(1));
}

#[tokio::test]
async fn single_process_compaction() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let shard = Uuid::new_v4();
    let db = open_db(&dir, app, shard).await;

    db.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();

    db.force_compaction().await.unwrap();

    let snapshots = names_with_suffix(&dir, ".sdsn");
    assert_eq!(snapshots, vec![format!("{app}.00000001.sdsn")]);
    assert!(names_with_suffix(&dir, ".sdsh").is_empty());
    assert_eq!(db.get().await.unwrap()["something"], json!(2));

    db.close().await.unwrap();
    db.open().await.unwrap();
    assert_eq!(db.get().await.unwrap()["something"], json!(2));
}

#[tokio::test]
async fn two_process_merge() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let p1 = open_db(&dir, app, Uuid::new_v4()).await;
    let p2 = open_db(&dir, app, Uuid::new_v4()).await;

    p1.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();
    p2.update(|doc| {
        doc["other"].as_array_mut().unwrap().push(json!("test1"));
        Ok(())
    })
    .await
    .unwrap();

    // P1's compaction folds P2's shard in; P1 sees the peer change at once.
    p1.force_compaction().await.unwrap();
    let view = p1.get().await.unwrap();
    assert_eq!(view["something"], json!(2));
    assert_eq!(view["other"], json!(["test1"]));

    // P2 only needs a rebase to pick everything up.
    p2.force_check_rebase().await.unwrap();
    let view = p2.get().await.unwrap();
    assert_eq!(view["something"], json!(2));
    assert_eq!(view["other"], json!(["test1"]));
}

#[tokio::test]
async fn stacked_reconciliation() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let p1 = open_db(&dir, app, Uuid::new_v4()).await;
    let p2 = open_db(&dir, app, Uuid::new_v4()).await;

    p1.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();
    p2.update(|doc| {
        doc["other"].as_array_mut().unwrap().push(json!("test1"));
        Ok(())
    })
    .await
    .unwrap();
    p1.force_compaction().await.unwrap();
    p2.force_check_rebase().await.unwrap();

    // Second round on top of generation 1.
    p1.update(|doc| {
        doc["something"] = json!(3);
        Ok(())
    })
    .await
    .unwrap();
    p2.update(|doc| {
        doc["other"].as_array_mut().unwrap().push(json!("test2"));
        Ok(())
    })
    .await
    .unwrap();
    p1.force_compaction().await.unwrap();

    // P2 reconciles through close and reopen alone.
    p2.close().await.unwrap();
    p2.open().await.unwrap();
    let view = p2.get().await.unwrap();
    assert_eq!(view["other"], json!(["test1", "test2"]));
    assert_eq!(view["something"], json!(3));
}

#[tokio::test]
async fn lock_contention_leaves_one_winner() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let p1 = open_db(&dir, app, Uuid::new_v4()).await;
    let p2 = open_db(&dir, app, Uuid::new_v4()).await;

    p1.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();
    p2.update(|doc| {
        doc["other"].as_array_mut().unwrap().push(json!("race"));
        Ok(())
    })
    .await
    .unwrap();

    let (r1, r2) = tokio::join!(p1.force_compaction(), async {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        p2.force_compaction().await
    });

    let winners = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one compaction must win: {r1:?} / {r2:?}");
    let loser = if r1.is_err() { r1 } else { r2 };
    assert!(
        matches!(
            loser,
            Err(Error::AlreadyLocked) | Err(Error::CouldNotLock) | Err(Error::NoShards)
        ),
        "loser must abort recoverably: {loser:?}"
    );

    // Exactly one snapshot at generation 1, and no lingering lockfiles.
    let snapshots = names_with_suffix(&dir, ".sdsn");
    assert_eq!(snapshots, vec![format!("{app}.00000001.sdsn")]);
    assert!(names_with_suffix(&dir, ".sdlk").is_empty());

    // Both parties converge after the loser rebases.
    p1.force_check_rebase().await.unwrap();
    p2.force_check_rebase().await.unwrap();
    for db in [&p1, &p2] {
        let view = db.get().await.unwrap();
        assert_eq!(view["something"], json!(2));
        assert_eq!(view["other"], json!(["race"]));
    }
}

#[tokio::test]
async fn truncated_shard_recovers_on_reopen() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let shard = Uuid::new_v4();
    let db = open_db(&dir, app, shard).await;

    db.update(|doc| {
        doc["something"] = json!(2);
        Ok(())
    })
    .await
    .unwrap();
    db.update(|doc| {
        doc["something"] = json!(5);
        Ok(())
    })
    .await
    .unwrap();
    db.close().await.unwrap();

    // Chop one byte off the second transaction's payload.
    let shard_name = format!("{shard}.00000000.sdsh");
    let path = dir.path().join(&shard_name);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

    db.open().await.unwrap();

    // The partial tail is gone and the last complete transaction stands.
    assert_eq!(db.get().await.unwrap()["something"], json!(2));
    assert!(std::fs::metadata(&path).unwrap().len() < bytes.len() as u64);

    // Life goes on: new updates append to the repaired shard.
    db.update(|doc| {
        doc["something"] = json!(7);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(db.get().await.unwrap()["something"], json!(7));
}

#[tokio::test]
async fn post_compaction_hook_fires() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(Arc<Value>, Arc<Value>)>();

    let db = Database::new(
        config(&dir, app, Uuid::new_v4()),
        json!({"something": 0, "other": []}),
        PatchMerge,
        Some(Box::new(move |merged, base| {
            let _ = tx.send((merged, base));
        })),
    )
    .await
    .unwrap();

    db.update(|doc| {
        doc["something"] = json!(42);
        Ok(())
    })
    .await
    .unwrap();
    db.force_compaction().await.unwrap();

    let (merged, base) = rx.recv().await.expect("hook fired");
    assert_eq!(merged["something"], json!(42));
    assert_eq!(base["something"], json!(0));
}

#[tokio::test]
async fn garbage_collection_drops_stale_generations() {
    let dir = TempDir::new().unwrap();
    let app = Uuid::new_v4();
    let db = open_db(&dir, app, Uuid::new_v4()).await;

    for round in 1..=3i64 {
        db.update(move |doc| {
            doc["something"] = json!(round);
            Ok(())
        })
        .await
        .unwrap();
        db.force_compaction().await.unwrap();
    }

    // Only the newest snapshot survives; every older generation lost its
    // last referencing shard when the compactor rebased.
    let snapshots = names_with_suffix(&dir, ".sdsn");
    assert_eq!(snapshots, vec![format!("{app}.00000003.sdsn")]);
    assert_eq!(db.get().await.unwrap()["something"], json!(3));
}
