//! GET engine: lazily-expanded depth-first traversal driven by client
//! "next" requests, streaming file bodies as raw regions on the control
//! channel with an optional CRC32 trailer.

use anyhow::Result;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::channel::Channel;
use crate::confine;
use crate::proto::{
    Api, ErrorCode, ErrorDescriptor, FileInfo, GetAction, GetNextParams, GetParams, Response,
    TransferSummary,
};
use crate::session::TransferCtx;

/// One pending traversal entry: the path to visit, the directory its
/// displayed name is computed against, and the wrapping prefix used when
/// the traversal root is the sharing root itself (so the sharing's name,
/// not a host path segment, becomes the top-level folder name).
struct Entry {
    fpath: PathBuf,
    basedir: PathBuf,
    prefix: Option<String>,
}

impl Entry {
    fn name(&self) -> String {
        let rel = self.fpath.strip_prefix(&self.basedir).unwrap_or(&self.fpath);
        match &self.prefix {
            Some(p) if rel.as_os_str().is_empty() => p.clone(),
            Some(p) => format!("{}/{}", p, rel.display()),
            None => rel.display().to_string(),
        }
    }
}

fn seed(ctx: &TransferCtx, spath: &str) -> Result<Entry, ErrorCode> {
    let fpath = confine::resolve_allowed(ctx.sharing, ctx.rcwd, spath)?;
    let (basedir, prefix) = if fpath == ctx.sharing.root {
        (fpath.clone(), Some(ctx.sharing.name.clone()))
    } else {
        (
            fpath.parent().unwrap_or(&fpath).to_path_buf(),
            None,
        )
    };
    Ok(Entry {
        fpath,
        basedir,
        prefix,
    })
}

pub fn serve_get(ctx: &TransferCtx, chan: &mut Channel, params: GetParams) -> Result<()> {
    chan.write_response(&Response::ok())?;

    let mut errors: Vec<ErrorDescriptor> = Vec::new();
    let paths = if params.paths.is_empty() {
        vec![".".to_string()]
    } else {
        params.paths.clone()
    };
    // Rejected seeds accumulate as errors; they never abort the transfer.
    let mut stack: Vec<Entry> = Vec::new();
    for spath in paths.iter().rev() {
        match seed(ctx, spath) {
            Ok(e) => stack.push(e),
            Err(code) => errors.push(ErrorDescriptor::new(code, spath.clone())),
        }
    }

    let mut aborted = false;
    'outer: loop {
        let req = chan.read_request()?;
        let action = match Api::parse(&req.api) {
            Some(Api::GetNext) => match req.parse_params::<GetNextParams>() {
                Ok(p) => p.action,
                Err(_) => {
                    chan.write_response(&Response::err(ErrorCode::InvalidRequest))?;
                    continue;
                }
            },
            _ => {
                chan.write_response(&Response::err(ErrorCode::InvalidRequest))?;
                continue;
            }
        };
        if action == GetAction::Abort {
            aborted = true;
            eprintln!("[{}] get aborted by client", ctx.tag);
            break;
        }

        // Walk the stack until something is worth responding about. The
        // top is peeked, not popped, so repeated metadata queries do not
        // lose position; directories are always consumed on sight.
        loop {
            let top = match stack.last() {
                Some(t) => t,
                None => {
                    // terminal empty success, then the summary below
                    chan.write_response(&Response::ok())?;
                    break 'outer;
                }
            };
            // Re-resolve through symlinks so a link planted after seeding
            // cannot smuggle content from outside the sharing.
            let real = match top.fpath.canonicalize() {
                Ok(r) => r,
                Err(_) => {
                    let name = top.name();
                    stack.pop();
                    errors.push(ErrorDescriptor::new(ErrorCode::NotExists, name));
                    continue;
                }
            };
            if !confine::is_allowed(ctx.sharing, &real) {
                let name = top.name();
                stack.pop();
                errors.push(ErrorDescriptor::new(ErrorCode::InvalidPath, name));
                continue;
            }
            // The hidden filter applies to the name the client sees; the
            // root seed carries the sharing name, so a sharing rooted in
            // a dot-directory is still served.
            if params.no_hidden {
                let visible = top.name();
                let last = visible.rsplit('/').next().unwrap_or("");
                if confine::is_hidden(std::ffi::OsStr::new(last)) {
                    stack.pop();
                    continue;
                }
            }
            let md = match std::fs::metadata(&real) {
                Ok(md) => md,
                Err(_) => {
                    let name = top.name();
                    stack.pop();
                    errors.push(ErrorDescriptor::new(ErrorCode::NotExists, name));
                    continue;
                }
            };

            if md.is_file() {
                let entry = stack.pop().expect("peeked entry");
                let name = entry.name();
                let info = FileInfo::from_metadata(&md, name.clone());
                if action == GetAction::Skip {
                    chan.write_response(&Response::with_data(&info)?)?;
                    continue 'outer;
                }
                let file = match std::fs::File::open(&real) {
                    Ok(f) => f,
                    Err(e) => {
                        let code = ErrorCode::from_io(&e);
                        errors.push(ErrorDescriptor::new(code, name.clone()));
                        chan.write_response(&Response::err_subjects(
                            code,
                            vec![ErrorDescriptor::new(code, name)],
                        ))?;
                        continue 'outer;
                    }
                };
                chan.write_response(&Response::with_data(&info)?)?;
                let size = md.len();
                if stream_file(chan, file, size, ctx.chunk_size, params.check)? {
                    ctx.log.transfer(ctx.tag, "get", &name, size);
                } else {
                    errors.push(ErrorDescriptor::new(
                        ErrorCode::CommandExecutionFailed,
                        name,
                    ));
                }
                continue 'outer;
            }

            if md.is_dir() {
                let entry = stack.pop().expect("peeked entry");
                let children = match list_children(&real) {
                    Ok(c) => c,
                    Err(e) => {
                        errors.push(ErrorDescriptor::new(ErrorCode::from_io(&e), entry.name()));
                        continue;
                    }
                };
                if children.is_empty() {
                    // Empty directories are reported so the receiver can
                    // recreate them; non-empty ones expand silently.
                    let info = FileInfo::from_metadata(&md, entry.name());
                    chan.write_response(&Response::with_data(&info)?)?;
                    continue 'outer;
                }
                for child in children.into_iter().rev() {
                    stack.push(Entry {
                        fpath: entry.fpath.join(child),
                        basedir: entry.basedir.clone(),
                        prefix: entry.prefix.clone(),
                    });
                }
                continue;
            }

            // special file vanished behind metadata; skip it
            let name = top.name();
            stack.pop();
            errors.push(ErrorDescriptor::new(ErrorCode::NotExists, name));
        }
    }

    let summary = TransferSummary {
        outcome: !aborted,
        errors,
        sync_results: None,
    };
    eprintln!(
        "[{}] get done outcome={} errors={}",
        ctx.tag,
        summary.outcome,
        summary.errors.len()
    );
    chan.write_response(&Response::with_data(&summary)?)
}

fn list_children(dir: &Path) -> std::io::Result<Vec<std::ffi::OsString>> {
    let mut names: Vec<std::ffi::OsString> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    names.sort();
    Ok(names)
}

/// Stream exactly `size` raw bytes. The declared length is honored even
/// when the file shrinks mid-stream (short reads are zero-padded), so the
/// channel never desynchronizes; returns false when padding happened.
fn stream_file(
    chan: &mut Channel,
    mut file: std::fs::File,
    size: u64,
    chunk_size: usize,
    check: bool,
) -> Result<bool> {
    let mut crc = crc32fast::Hasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = size;
    let mut clean = true;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match file.read(&mut buf[..want]) {
            Ok(0) | Err(_) => {
                buf[..want].fill(0);
                clean = false;
                want
            }
            Ok(n) => n,
        };
        if check {
            crc.update(&buf[..n]);
        }
        chan.write_raw(&buf[..n])?;
        remaining -= n as u64;
    }
    if check {
        chan.write_raw(&crc.finalize().to_be_bytes())?;
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::Sharing;
    use tempfile::TempDir;

    fn ctx<'a>(sharing: &'a Sharing, rcwd: &'a Path) -> TransferCtx<'a> {
        TransferCtx {
            sharing,
            rcwd,
            chunk_size: 1024,
            tag: "test",
            log: &crate::logger::NoopLogger,
        }
    }

    #[test]
    fn test_seed_root_wraps_in_sharing_name() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), b"x").unwrap();
        let sharing = Sharing::new("music", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        let e = seed(&c, ".").unwrap();
        assert_eq!(e.name(), "music");
        // a child inherits the prefix, so host segments never leak
        let child = Entry {
            fpath: e.fpath.join("f.txt"),
            basedir: e.basedir.clone(),
            prefix: e.prefix.clone(),
        };
        assert_eq!(child.name(), "music/f.txt");
    }

    #[test]
    fn test_seed_subpath_uses_basename() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        let e = seed(&c, "a/b").unwrap();
        assert_eq!(e.name(), "b");
        let child = Entry {
            fpath: e.fpath.join("c.txt"),
            basedir: e.basedir.clone(),
            prefix: None,
        };
        assert_eq!(child.name(), "b/c.txt");
    }

    #[test]
    fn test_seed_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);
        assert!(matches!(seed(&c, "../.."), Err(ErrorCode::InvalidPath)));
    }

    #[test]
    fn test_file_sharing_seed_reports_sharing_name() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("host-name.bin");
        std::fs::write(&f, b"x").unwrap();
        let sharing = Sharing::new("nice-name", &f, false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);
        let e = seed(&c, ".").unwrap();
        assert_eq!(e.name(), "nice-name");
    }
}
