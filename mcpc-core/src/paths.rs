//! C1: home directory layout, socket/pipe paths, process liveness.

use std::path::PathBuf;

/// Abstraction over the home directory so tests never touch the real
/// `~/.mcpc`. Mirrors the teacher's `ConfigProvider` seam.
pub trait PathProvider: Send + Sync {
    fn home_dir(&self) -> PathBuf;
}

#[derive(Default, Clone, Copy)]
pub struct OsPathProvider;

impl PathProvider for OsPathProvider {
    fn home_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("MCPC_HOME_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcpc")
    }
}

pub fn sessions_path(pp: &dyn PathProvider) -> PathBuf {
    pp.home_dir().join("sessions.json")
}

pub fn profiles_path(pp: &dyn PathProvider) -> PathBuf {
    pp.home_dir().join("profiles.json")
}

pub fn bridges_dir(pp: &dyn PathProvider) -> PathBuf {
    pp.home_dir().join("bridges")
}

pub fn logs_dir(pp: &dyn PathProvider) -> PathBuf {
    pp.home_dir().join("logs")
}

pub fn log_path(pp: &dyn PathProvider, name: &str) -> PathBuf {
    logs_dir(pp).join(format!("bridge-{}.log", strip_at(name)))
}

/// Session-name-keyed socket path. On POSIX this is a real path under
/// `bridges/`; on Windows it's a named pipe path with no backing directory.
pub fn socket_path(pp: &dyn PathProvider, name: &str) -> PathBuf {
    #[cfg(unix)]
    {
        bridges_dir(pp).join(format!("{}.sock", strip_at(name)))
    }
    #[cfg(windows)]
    {
        PathBuf::from(format!("\\\\.\\pipe\\mcpc-{}", strip_at(name)))
    }
}

fn strip_at(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

/// Regex-equivalent session name validation (no regex dependency needed for
/// this small grammar): `@` + 1..64 chars of `[A-Za-z0-9_-]`, first char
/// alphanumeric.
pub fn is_valid_session_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('@') else {
        return false;
    };
    if rest.is_empty() || rest.len() > 64 {
        return false;
    }
    let mut chars = rest.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    rest.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Cross-platform best-effort liveness probe for a PID owned by this user.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0
}

#[cfg(windows)]
pub fn pid_is_alive(pid: u32) -> bool {
    use std::process::Command;
    let Ok(out) = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
    else {
        return false;
    };
    String::from_utf8_lossy(&out.stdout).contains(&pid.to_string())
}

#[cfg(not(any(unix, windows)))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone)]
    pub(crate) struct TempPathProvider {
        pub base: PathBuf,
    }

    impl TempPathProvider {
        pub fn new(tag: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "mcpc-test-{}-{}-{}-{}",
                tag,
                std::process::id(),
                n,
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self { base: dir }
        }
    }

    impl PathProvider for TempPathProvider {
        fn home_dir(&self) -> PathBuf {
            self.base.clone()
        }
    }

    #[test]
    fn session_name_validation() {
        assert!(is_valid_session_name("@x"));
        assert!(is_valid_session_name("@my-session_1"));
        assert!(!is_valid_session_name("x"));
        assert!(!is_valid_session_name("@"));
        assert!(!is_valid_session_name("@_abc"));
        assert!(!is_valid_session_name("@abc def"));
        let too_long = format!("@{}", "a".repeat(65));
        assert!(!is_valid_session_name(&too_long));
        let max_len = format!("@{}", "a".repeat(64));
        assert!(is_valid_session_name(&max_len));
    }

    #[test]
    fn socket_path_is_pure_function_of_name() {
        let pp = TempPathProvider::new("paths");
        let a = socket_path(&pp, "@x");
        let b = socket_path(&pp, "@x");
        assert_eq!(a, b);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(pid_is_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        // PID 1 exists on most unix systems (init); use an implausibly high one.
        assert!(!pid_is_alive(u32::MAX - 1));
    }
}

#[cfg(test)]
pub(crate) use tests::TempPathProvider;
