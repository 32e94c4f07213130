//! Rotating file logger and `tracing-subscriber` init shared by `mcpc` and
//! `mcpc-bridge`. Grounded on the teacher's `logging_sqlite.rs` writer
//! loop — background flushing state machine behind a handle — but adapted
//! from batched DuckDB rows to byte-count file rotation, since this spec
//! asks for rotating log files (§4.5 step 1: 10MB × 5 files), not a
//! queryable event store.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;

const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_BACKUPS: u32 = 5;

struct RotatingState {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingState {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(path)?;
        let written = file.metadata()?.len();
        Ok(Self { path: path.to_path_buf(), file, written })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..MAX_BACKUPS).rev() {
            let from = backup_path(&self.path, i);
            let to = backup_path(&self.path, i + 1);
            if from.exists() {
                let _ = std::fs::rename(from, to);
            }
        }
        let _ = std::fs::rename(&self.path, backup_path(&self.path, 1));
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    path.with_extension(format!("log.{n}"))
}

impl Write for RotatingState {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_FILE_BYTES && self.written > 0 {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// `MakeWriter` implementation: one rotating file shared across all spans,
/// guarded by a mutex since `tracing-subscriber` may invoke it concurrently.
#[derive(Clone)]
pub struct RotatingFileWriter {
    state: std::sync::Arc<Mutex<RotatingState>>,
}

impl RotatingFileWriter {
    pub fn new(path: &Path) -> io::Result<Self> {
        Ok(Self { state: std::sync::Arc::new(Mutex::new(RotatingState::open(path)?)) })
    }
}

pub struct RotatingFileWriterGuard<'a> {
    guard: std::sync::MutexGuard<'a, RotatingState>,
}

impl Write for RotatingFileWriterGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriterGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileWriterGuard { guard: self.state.lock().expect("log writer mutex poisoned") }
    }
}

/// Initializes a `tracing-subscriber` registry writing to `log_path`, with
/// `RUST_LOG`/`verbose` controlling the filter. Returns the guard the
/// caller must keep alive for the process lifetime (there is none here
/// beyond the writer itself, but the signature mirrors `tracing-appender`'s
/// non-blocking guard convention so call sites don't need to change if a
/// non-blocking writer is introduced later).
pub fn init_file_logging(log_path: &Path, verbose: bool) -> io::Result<RotatingFileWriter> {
    let writer = RotatingFileWriter::new(log_path)?;
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer.clone())
        .with_ansi(false)
        .init();
    Ok(writer)
}

/// CLI-side logging: human-readable to stderr, no file by default.
pub fn init_stderr_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn tmp_log_path(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("mcpc-logging-test-{tag}-{}-{n}", std::process::id()))
    }

    #[test]
    fn writes_go_to_the_file() {
        let path = tmp_log_path("basic");
        let writer = RotatingFileWriter::new(&path).unwrap();
        {
            let mut w = writer.make_writer();
            w.write_all(b"hello\n").unwrap();
            w.flush().unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn rotates_when_max_size_exceeded() {
        let path = tmp_log_path("rotate");
        let state = std::sync::Arc::new(Mutex::new(RotatingState::open(&path).unwrap()));
        {
            let mut guard = state.lock().unwrap();
            guard.written = MAX_FILE_BYTES;
        }
        {
            let mut guard = state.lock().unwrap();
            guard.write_all(b"more").unwrap();
        }
        assert!(backup_path(&path, 1).exists());
    }
}
