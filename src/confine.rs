//! Two-path confinement: mapping between sharing-relative paths (SPaths)
//! and absolute filesystem paths (FPaths), plus the single choke point
//! that keeps every resolved path inside a sharing's root.
//!
//! Every filesystem-touching handler resolves then validates before
//! touching the disk; a failed check is ordinary control flow, reported
//! as `InvalidPath` naming only the client-supplied path.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

use crate::proto::ErrorCode;
use crate::sharing::Sharing;

/// Resolve a client-supplied SPath to an absolute FPath.
///
/// A leading separator roots the path at the sharing root; anything else
/// is relative to `rcwd`. `.`/`..` are folded lexically, then symlinks in
/// the deepest existing ancestor are resolved, so `is_allowed` judges the
/// real target. The result may lie outside the root; only `is_allowed`
/// decides legality.
pub fn resolve(sharing: &Sharing, rcwd: &Path, spath: &str) -> PathBuf {
    if !sharing.is_directory() {
        // A file sharing has exactly one addressable entry: the root
        // itself, reachable as "", ".", "/" or the sharing's name.
        return match spath {
            "" | "." | "/" => sharing.root.clone(),
            s if s == sharing.name => sharing.root.clone(),
            s => sharing.root.join(s.trim_start_matches('/')),
        };
    }
    let (base, rel): (&Path, &str) = if let Some(stripped) = spath.strip_prefix('/') {
        (&sharing.root, stripped)
    } else {
        (rcwd, spath)
    };
    canonicalize_lenient(&lexical_join(base, Path::new(rel)))
}

fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(s) => out.push(s),
            // Leading separators were stripped by the caller; prefixes
            // cannot appear in a sharing-relative path.
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor of `p` and re-append the
/// not-yet-existing tail, so paths about to be created are still judged
/// through any symlinks in their parents.
fn canonicalize_lenient(p: &Path) -> PathBuf {
    if let Ok(c) = p.canonicalize() {
        return c;
    }
    let mut tail = Vec::new();
    let mut cur = p;
    loop {
        match (cur.parent(), cur.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                if let Ok(mut c) = parent.canonicalize() {
                    for seg in tail.iter().rev() {
                        c.push(seg);
                    }
                    return c;
                }
                cur = parent;
            }
            _ => return p.to_path_buf(),
        }
    }
}

/// True iff `fpath` stays inside the sharing. For a file-kind sharing
/// only the root itself is addressable.
pub fn is_allowed(sharing: &Sharing, fpath: &Path) -> bool {
    if sharing.is_directory() {
        fpath.starts_with(&sharing.root)
    } else {
        fpath == sharing.root
    }
}

/// `resolve` + `is_allowed` in one step, with the NUL defense the wire
/// layer cannot provide. The error names nothing about the host layout.
pub fn resolve_allowed(sharing: &Sharing, rcwd: &Path, spath: &str) -> Result<PathBuf, ErrorCode> {
    if spath.contains('\0') {
        return Err(ErrorCode::InvalidPath);
    }
    let fpath = resolve(sharing, rcwd, spath);
    if is_allowed(sharing, &fpath) {
        Ok(fpath)
    } else {
        Err(ErrorCode::InvalidPath)
    }
}

/// Re-resolve an already-joined FPath through any symlinks and validate
/// it. Used on constructed destinations (base + sanitized relative name)
/// where a link in the middle could still point outside the root.
pub fn allowed_real(sharing: &Sharing, fpath: &Path) -> Result<PathBuf, ErrorCode> {
    let real = canonicalize_lenient(fpath);
    if is_allowed(sharing, &real) {
        Ok(real)
    } else {
        Err(ErrorCode::InvalidPath)
    }
}

/// Inverse mapping: report an FPath back to the client as a root-relative
/// SPath without leaking host path segments. A file-kind sharing is
/// always reported as its sharing name, never the host basename.
pub fn display_path(sharing: &Sharing, fpath: &Path) -> String {
    if !sharing.is_directory() {
        return format!("/{}", sharing.name);
    }
    match fpath.strip_prefix(&sharing.root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => "/".to_string(),
    }
}

/// Validate a peer-supplied relative path (a transfer entry name) down to
/// plain components: no NUL, no absolute/parent/prefix components, at
/// least one segment. Used on both sides of a transfer before joining
/// under a local base.
pub fn safe_relative(name: &str) -> Result<PathBuf> {
    if name.contains('\0') {
        bail!("path contains NUL byte");
    }
    let mut safe = PathBuf::new();
    for comp in Path::new(name).components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("path contains disallowed component: {:?}", comp);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty path");
    }
    Ok(safe)
}

/// Hidden entries are dot-named.
pub fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::Sharing;
    use std::fs;
    use tempfile::TempDir;

    fn dir_sharing(tmp: &TempDir) -> Sharing {
        Sharing::new("share", tmp.path(), false).unwrap()
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        let s = dir_sharing(&tmp);
        let rcwd = s.root.join("a");

        assert_eq!(resolve(&s, &rcwd, "b"), s.root.join("a/b"));
        assert_eq!(resolve(&s, &rcwd, "/a/b"), s.root.join("a/b"));
        assert_eq!(resolve(&s, &rcwd, "."), s.root.join("a"));
        assert_eq!(resolve(&s, &rcwd, ".."), s.root.clone());
        assert_eq!(resolve(&s, &rcwd, "/"), s.root.clone());
    }

    #[test]
    fn test_escape_is_resolved_but_disallowed() {
        let tmp = TempDir::new().unwrap();
        let s = dir_sharing(&tmp);
        let rcwd = s.root.clone();

        for p in ["..", "../..", "../etc/passwd", "/../outside", "a/../../.."] {
            let f = resolve(&s, &rcwd, p);
            if !f.starts_with(&s.root) {
                assert!(!is_allowed(&s, &f), "{p} should be disallowed");
            }
            // the combined check must refuse every true escape
            if p.contains("..") && !resolve(&s, &rcwd, p).starts_with(&s.root) {
                assert_eq!(resolve_allowed(&s, &rcwd, p), Err(ErrorCode::InvalidPath));
            }
        }
        assert_eq!(
            resolve_allowed(&s, &rcwd, "ok\0bad"),
            Err(ErrorCode::InvalidPath)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_disallowed() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"s").unwrap();
        let s = dir_sharing(&tmp);
        std::os::unix::fs::symlink(outside.path(), s.root.join("link")).unwrap();

        assert_eq!(
            resolve_allowed(&s, &s.root, "link/secret"),
            Err(ErrorCode::InvalidPath)
        );
    }

    #[test]
    fn test_resolve_nonexistent_tail() {
        let tmp = TempDir::new().unwrap();
        let s = dir_sharing(&tmp);
        let f = resolve_allowed(&s, &s.root, "new/deep/file.txt").unwrap();
        assert!(f.starts_with(&s.root));
        assert!(f.ends_with("new/deep/file.txt"));
    }

    #[test]
    fn test_file_sharing_exact_equality() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("payload.bin");
        fs::write(&f, b"data").unwrap();
        let s = Sharing::new("payload", &f, true).unwrap();

        assert_eq!(resolve_allowed(&s, &s.root, "").unwrap(), s.root);
        assert_eq!(resolve_allowed(&s, &s.root, ".").unwrap(), s.root);
        assert_eq!(resolve_allowed(&s, &s.root, "payload").unwrap(), s.root);
        assert!(resolve_allowed(&s, &s.root, "payload.bin").is_err());
        assert!(resolve_allowed(&s, &s.root, "../payload.bin").is_err());
        assert_eq!(display_path(&s, &s.root), "/payload");
    }

    #[test]
    fn test_display_path() {
        let tmp = TempDir::new().unwrap();
        let s = dir_sharing(&tmp);
        assert_eq!(display_path(&s, &s.root), "/");
        assert_eq!(display_path(&s, &s.root.join("a/b")), "/a/b");
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(
            safe_relative("a/./b").unwrap(),
            PathBuf::from("a/b")
        );
        assert!(safe_relative("../a").is_err());
        assert!(safe_relative("/abs").is_err());
        assert!(safe_relative("a\0b").is_err());
        assert!(safe_relative("").is_err());
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(std::ffi::OsStr::new(".git")));
        assert!(!is_hidden(std::ffi::OsStr::new("git")));
    }
}
