//! Verification gate against the on-disk and remote manifest stores

mod common;

use common::{fixture, init_test_logging, StaticFetcher, INSTALLER_URL};
use nebula_core::trust::{
    hash_bytes, DirectoryStore, GateSettings, GateState, ManifestEntry, ManifestWriter,
    RejectReason, RemoteManifest, StoreError, Target, VerificationGate, Verdict,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const MANIFEST_URL: &str = "https://raw.githubusercontent.com/example/nebula/main/manifests/mise";

fn settings(platform: &str) -> GateSettings {
    GateSettings {
        installer_url: INSTALLER_URL.to_string(),
        platform: platform.to_string(),
    }
}

async fn pinned_dir(version: &str, script: &[u8]) -> (TempDir, Arc<DirectoryStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DirectoryStore::new(dir.path()));
    let entry = ManifestEntry::new(
        version,
        hash_bytes(script),
        ["linux-x64", "macos-arm64"].into_iter().collect(),
    );
    store.put(&entry).await.unwrap();
    store.advance_latest(version).await.unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_matching_script_is_admitted() {
    init_test_logging();
    let script = fixture("mise-install.sh");
    let (_dir, store) = pinned_dir("v2025.1.6", &script).await;
    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, script.clone()));

    let gate = VerificationGate::new(fetcher, store, settings("linux-x64"));
    let result = gate.verify(&Target::Latest).await.unwrap();

    assert!(result.is_admitted());
    assert_eq!(result.verdict(), &Verdict::Admit);
    assert!(result.states().last().is_some_and(GateState::is_terminal));
    assert_eq!(result.version(), Some("v2025.1.6"));
    assert_eq!(result.expected_hash(), result.actual_hash());
    assert_eq!(result.into_script(), Some(script));
}

#[tokio::test]
async fn test_changed_script_is_an_integrity_mismatch() {
    init_test_logging();
    let pinned = fixture("mise-install.sh");
    let (_dir, store) = pinned_dir("v2025.1.6", &pinned).await;

    let mut tampered = pinned.clone();
    tampered.extend_from_slice(b"curl -s https://mise.run/telemetry\n");
    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, tampered.clone()));

    let gate = VerificationGate::new(fetcher, store, settings("linux-x64"));
    let result = gate
        .verify(&Target::Version("v2025.1.6".to_string()))
        .await
        .unwrap();

    assert_eq!(
        result.reject_reason(),
        Some(&RejectReason::IntegrityMismatch {
            expected: hash_bytes(&pinned),
            actual: hash_bytes(&tampered),
        })
    );
    assert!(result.script().is_none());
    assert_eq!(
        result.states(),
        &[GateState::Fetching, GateState::Hashing, GateState::Reject]
    );
}

#[tokio::test]
async fn test_platform_constraint_is_enforced() {
    let script = fixture("mise-install.sh");
    let (_dir, store) = pinned_dir("v2025.1.6", &script).await;
    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, script));

    let gate = VerificationGate::new(fetcher, store, settings("windows-x64"));
    let result = gate.verify(&Target::Latest).await.unwrap();

    assert!(matches!(
        result.reject_reason(),
        Some(RejectReason::PlatformNotAllowed { platform, .. }) if platform == "windows-x64"
    ));
}

#[tokio::test]
async fn test_fresh_store_rejects_as_not_pinned() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DirectoryStore::new(dir.path()));
    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, "echo hi\n"));

    let gate = VerificationGate::new(fetcher, store, settings("linux-x64"));

    let latest = gate.verify(&Target::Latest).await.unwrap();
    assert!(matches!(
        latest.reject_reason(),
        Some(RejectReason::NotPinned { .. })
    ));

    let traversal = gate
        .verify(&Target::Version("../../etc/passwd".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        traversal.reject_reason(),
        Some(RejectReason::NotPinned { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_installer_is_a_fetch_failure() {
    let (_dir, store) = pinned_dir("v2025.1.6", b"echo hi\n").await;
    let fetcher = Arc::new(StaticFetcher::new().fail(INSTALLER_URL, 502));

    let gate = VerificationGate::new(fetcher, store, settings("linux-x64"));
    let result = gate.verify(&Target::Latest).await.unwrap();

    match result.reject_reason() {
        Some(RejectReason::FetchFailure { detail }) => assert!(detail.contains("502")),
        other => panic!("expected fetch failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_broken_pointer_is_an_error_not_a_verdict() {
    init_test_logging();
    let (dir, store) = pinned_dir("v2025.1.6", b"echo hi\n").await;
    fs::remove_file(dir.path().join("v2025.1.6.conf")).unwrap();

    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, "echo hi\n"));
    let gate = VerificationGate::new(fetcher, store, settings("linux-x64"));

    let err = gate.verify(&Target::Latest).await.unwrap_err();
    assert!(matches!(err, StoreError::BrokenPointer { ref version } if version == "v2025.1.6"));
    assert!(err.is_corruption());
}

#[tokio::test]
async fn test_remote_manifest_gate() {
    let script = fixture("mise-install.sh");
    let record = format!(
        "BOOTSTRAPPER_SHA256={}\nALLOWED_PLATFORMS=linux-x64\n",
        hash_bytes(&script)
    );
    let fetcher = Arc::new(
        StaticFetcher::new()
            .serve(INSTALLER_URL, script.clone())
            .serve(&format!("{MANIFEST_URL}/latest"), "v2025.1.6\n")
            .serve(&format!("{MANIFEST_URL}/v2025.1.6.conf"), record),
    );

    let manifests = Arc::new(RemoteManifest::new(fetcher.clone(), MANIFEST_URL));
    let gate = VerificationGate::new(fetcher.clone(), manifests, settings("linux-x64"));
    let result = gate.verify(&Target::Latest).await.unwrap();

    assert!(result.is_admitted());
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_remote_manifest_outage_is_a_fetch_failure() {
    let fetcher = Arc::new(
        StaticFetcher::new()
            .serve(INSTALLER_URL, "echo hi\n")
            .fail(&format!("{MANIFEST_URL}/latest"), 503),
    );

    let manifests = Arc::new(RemoteManifest::new(fetcher.clone(), MANIFEST_URL));
    let gate = VerificationGate::new(fetcher, manifests, settings("linux-x64"));
    let result = gate.verify(&Target::Latest).await.unwrap();

    assert!(matches!(
        result.reject_reason(),
        Some(RejectReason::FetchFailure { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_attempts_are_independent() {
    let script = fixture("mise-install.sh");
    let (_dir, store) = pinned_dir("v2025.1.6", &script).await;
    let fetcher = Arc::new(StaticFetcher::new().serve(INSTALLER_URL, script));
    let gate = Arc::new(VerificationGate::new(fetcher, store, settings("linux-x64")));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.verify(&Target::Latest).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_admitted());
    }
}
