//! Integration test for the orphan log GC daemon.rs runs once at startup
//! (SPEC_FULL.md's "Orphan log GC" supplement). Drives it through the
//! public `mcpc_bridge::daemon::gc_orphan_logs` entry point against a real
//! temp-directory `PathProvider`, the same seam `mcpc-core`'s own tests use.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use mcpc_bridge::daemon::gc_orphan_logs;
use mcpc_core::paths::{logs_dir, PathProvider};
use mcpc_core::registry::{self, ServerDescriptor, SessionRecord, SessionStatus};

static COUNTER: AtomicU64 = AtomicU64::new(0);

struct TempPaths {
    base: PathBuf,
}

impl TempPaths {
    fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = std::env::temp_dir().join(format!("mcpc-bridge-test-{tag}-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&base).unwrap();
        Self { base }
    }
}

impl PathProvider for TempPaths {
    fn home_dir(&self) -> PathBuf {
        self.base.clone()
    }
}

fn write_log(pp: &TempPaths, stem: &str) -> PathBuf {
    let dir = logs_dir(pp);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("bridge-{stem}.log"));
    std::fs::write(&path, b"hello\n").unwrap();
    path
}

fn sample_record(name: &str) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        name: name.to_string(),
        server: ServerDescriptor::Http { url: "https://mcp.example.com".to_string(), headers: None, timeout_seconds: None },
        pid: Some(std::process::id()),
        profile_name: None,
        header_count: 0,
        created_at: now,
        last_seen_at: now,
        status: SessionStatus::Active,
        protocol_version: None,
    }
}

#[test]
fn removes_logs_for_sessions_no_longer_in_the_registry() {
    let pp = TempPaths::new("orphan");
    registry::save(&pp, sample_record("@alive")).unwrap();

    let orphan = write_log(&pp, "orphan");
    let alive = write_log(&pp, "alive");
    let current = write_log(&pp, "current");

    gc_orphan_logs(&pp, "@current");

    assert!(!orphan.exists(), "log for a session absent from the registry should be removed");
    assert!(alive.exists(), "log for a registered session must survive");
    assert!(current.exists(), "the running daemon's own log must survive even before its registry entry lands");
}

#[test]
fn is_a_no_op_when_the_logs_directory_does_not_exist_yet() {
    let pp = TempPaths::new("orphan-missing-dir");
    gc_orphan_logs(&pp, "@current");
}
