use std::path::{Path, PathBuf};
use std::sync::Arc;

use tau_slowmode::{
    load_slowmode_replay_fixture, run_slowmode_replay, InMemoryLeaseStore, SlowmodeRuntimeConfig,
    SqliteLeaseStore,
};
use tempfile::tempdir;

fn fixture_paths() -> Vec<PathBuf> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures");
    let mut paths = std::fs::read_dir(&dir)
        .expect("read fixtures dir")
        .map(|entry| entry.expect("fixture entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[tokio::test]
async fn integration_fixtures_replay_with_expected_outcomes() {
    let paths = fixture_paths();
    assert!(!paths.is_empty());
    for path in paths {
        let fixture = load_slowmode_replay_fixture(&path).expect("load fixture");
        let report = run_slowmode_replay(
            &fixture,
            Arc::new(InMemoryLeaseStore::new()),
            &SlowmodeRuntimeConfig::default(),
        )
        .await
        .expect("replay");
        assert!(
            report.mismatches().is_empty(),
            "{}: {:?}",
            path.display(),
            report.mismatches()
        );
    }
}

#[tokio::test]
async fn integration_replay_on_sqlite_matches_memory() {
    let temp = tempdir().expect("tempdir");
    for (index, path) in fixture_paths().into_iter().enumerate() {
        let fixture = load_slowmode_replay_fixture(&path).expect("load fixture");
        let in_memory = run_slowmode_replay(
            &fixture,
            Arc::new(InMemoryLeaseStore::new()),
            &SlowmodeRuntimeConfig::default(),
        )
        .await
        .expect("memory replay");
        let sqlite = SqliteLeaseStore::new(temp.path().join(format!("replay-{index}.sqlite")))
            .expect("open sqlite");
        let persisted = run_slowmode_replay(
            &fixture,
            Arc::new(sqlite),
            &SlowmodeRuntimeConfig::default(),
        )
        .await
        .expect("sqlite replay");

        assert_eq!(in_memory.reason_code_counts, persisted.reason_code_counts);
        assert_eq!(in_memory.sweep, persisted.sweep);
        serde_json::to_string(&persisted).expect("report serializes");
    }
}
