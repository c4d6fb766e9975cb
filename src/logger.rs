//! Optional append-only operation log for the daemon. Stderr status lines
//! stay on regardless; this records mutating commands and transfers for
//! operability when `--log-file` is set.

use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn session(&self, _tag: &str, _peer: &str) {}
    fn command(&self, _tag: &str, _line: &str) {}
    fn transfer(&self, _tag: &str, _verb: &str, _path: &str, _bytes: u64) {}
    fn error(&self, _tag: &str, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session(&self, tag: &str, peer: &str) {
        self.line(&format!("SESSION tag={} peer={}", tag, peer));
    }
    fn command(&self, tag: &str, line: &str) {
        self.line(&format!("CMD tag={} {}", tag, line));
    }
    fn transfer(&self, tag: &str, verb: &str, path: &str, bytes: u64) {
        self.line(&format!("XFER tag={} {} path={} bytes={}", tag, verb, path, bytes));
    }
    fn error(&self, tag: &str, context: &str, msg: &str) {
        self.line(&format!("ERROR tag={} ctx={} msg={}", tag, context, msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_logger_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ops.log");
        let log = TextLogger::new(&path).unwrap();
        log.session("abc", "127.0.0.1:9");
        log.command("abc", "mkdir /x");
        log.transfer("abc", "put", "/x/a.bin", 42);
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 3);
        assert!(body.contains("CMD tag=abc mkdir /x"));
        assert!(body.contains("bytes=42"));
    }
}
