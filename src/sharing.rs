//! Exported sharings and server configuration

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logger::{Logger, NoopLogger};
use crate::proto::{FileType, SharingInfo, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingKind {
    File,
    Directory,
}

/// A named, exported root. Built at startup, immutable for the process
/// lifetime, shared by reference across all sessions.
#[derive(Debug, Clone)]
pub struct Sharing {
    pub name: String,
    pub kind: SharingKind,
    pub root: PathBuf,
    pub read_only: bool,
}

impl Sharing {
    pub fn new(name: impl Into<String>, path: &Path, read_only: bool) -> Result<Self> {
        let root = path
            .canonicalize()
            .with_context(|| format!("sharing path {}", path.display()))?;
        let md = std::fs::metadata(&root)?;
        let kind = if md.is_dir() {
            SharingKind::Directory
        } else {
            SharingKind::File
        };
        let name = name.into();
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            bail!("invalid sharing name: {:?}", name);
        }
        Ok(Self {
            name,
            kind,
            root,
            read_only,
        })
    }

    /// Parse a `NAME=PATH[:ro]` or bare `PATH[:ro]` command-line spec; a
    /// bare path takes its basename as the sharing name.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let (spec, read_only) = match spec.strip_suffix(":ro") {
            Some(s) => (s, true),
            None => (spec, false),
        };
        let (name, path) = match spec.split_once('=') {
            Some((n, p)) => (n.to_string(), PathBuf::from(p)),
            None => {
                let p = PathBuf::from(spec);
                let n = p
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (n, p)
            }
        };
        Sharing::new(name, &path, read_only)
    }

    pub fn is_directory(&self) -> bool {
        self.kind == SharingKind::Directory
    }

    pub fn info(&self) -> SharingInfo {
        SharingInfo {
            name: self.name.clone(),
            ftype: match self.kind {
                SharingKind::Directory => FileType::Dir,
                SharingKind::File => FileType::File,
            },
            read_only: self.read_only,
        }
    }
}

/// Opaque password-verification capability. Hashing internals live behind
/// this seam.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, candidate: &str) -> bool;
    /// Whether connect() needs a password at all.
    fn required(&self) -> bool;
}

/// No password configured; every connect succeeds.
pub struct OpenAccess;

impl Authenticator for OpenAccess {
    fn authenticate(&self, _candidate: &str) -> bool {
        true
    }
    fn required(&self) -> bool {
        false
    }
}

/// Single shared secret for the whole server.
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authenticator for SharedSecret {
    fn authenticate(&self, candidate: &str) -> bool {
        // Constant-time-ish compare; length leak is acceptable here.
        candidate.len() == self.secret.len()
            && candidate
                .bytes()
                .zip(self.secret.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
    fn required(&self) -> bool {
        true
    }
}

/// Immutable startup configuration handed to the server and every session.
pub struct ServerConfig {
    pub name: String,
    pub bind: String,
    pub sharings: Vec<Sharing>,
    pub auth: Arc<dyn Authenticator>,
    /// UDP discovery responder port; None disables discovery.
    pub discovery_port: Option<u16>,
    pub chunk_size: usize,
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    pub fn new(sharings: Vec<Sharing>) -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "skiff".to_string());
        Self {
            name,
            bind: format!("0.0.0.0:{}", DEFAULT_PORT),
            sharings,
            auth: Arc::new(OpenAccess),
            discovery_port: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn sharing(&self, name: &str) -> Option<&Sharing> {
        self.sharings.iter().find(|s| s.name == name)
    }

    pub fn port(&self) -> u16 {
        self.bind
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_named() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = format!("stuff={}", tmp.path().display());
        let s = Sharing::from_spec(&spec).unwrap();
        assert_eq!(s.name, "stuff");
        assert_eq!(s.kind, SharingKind::Directory);
        assert!(!s.read_only);
    }

    #[test]
    fn test_from_spec_bare_readonly() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir(&dir).unwrap();
        let s = Sharing::from_spec(&format!("{}:ro", dir.display())).unwrap();
        assert_eq!(s.name, "docs");
        assert!(s.read_only);
    }

    #[test]
    fn test_file_sharing_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("one.bin");
        std::fs::write(&f, b"x").unwrap();
        let s = Sharing::new("one", &f, false).unwrap();
        assert_eq!(s.kind, SharingKind::File);
        assert!(!s.is_directory());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Sharing::new("a/b", tmp.path(), false).is_err());
    }

    #[test]
    fn test_shared_secret() {
        let a = SharedSecret::new("sesame");
        assert!(a.authenticate("sesame"));
        assert!(!a.authenticate("sesamE"));
        assert!(!a.authenticate(""));
        assert!(a.required());
        assert!(!OpenAccess.required());
    }
}
