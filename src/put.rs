//! PUT engine: client-driven upload negotiation, raw-region receive with
//! CRC verification, and optional one-way sync (orphan deletion).

use anyhow::Result;
use filetime::FileTime;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::channel::Channel;
use crate::confine;
use crate::proto::{
    Api, ErrorCode, ErrorDescriptor, FileInfo, FileType, OverwritePolicy, PutNextParams,
    PutNextReply, PutParams, PutStatus, Response, SyncResult, TransferSummary,
};
use crate::session::TransferCtx;

enum Decision {
    Accept,
    Refuse,
    Uncertain,
}

/// Resolve an incoming entry's destination honoring the `dest` semantics,
/// evaluated once per entry. An entry counts as a "directory source" when
/// it is a directory or carries a nested name.
fn dest_target(
    ctx: &TransferCtx,
    params: &PutParams,
    info: &FileInfo,
) -> Result<PathBuf, ErrorCode> {
    let rel = confine::safe_relative(&info.name).map_err(|_| ErrorCode::InvalidPath)?;
    let dest = match &params.dest {
        None => return Ok(ctx.rcwd.join(rel)),
        Some(d) => d,
    };
    let dest_f = confine::resolve_allowed(ctx.sharing, ctx.rcwd, dest)?;
    let dest_md = std::fs::metadata(&dest_f).ok();
    if params.is_multiple {
        // multiple sources require an existing directory destination
        return match dest_md {
            Some(md) if md.is_dir() => Ok(dest_f.join(rel)),
            _ => Err(ErrorCode::InvalidDestSemantic),
        };
    }
    let plain_file = info.ftype == FileType::File && rel.components().count() == 1;
    if plain_file {
        Ok(match dest_md {
            Some(md) if md.is_dir() => dest_f.join(&rel),
            // overwrite an existing file, or upload-as-rename when the
            // destination does not exist yet
            _ => dest_f,
        })
    } else {
        match dest_md {
            Some(md) if !md.is_dir() => Err(ErrorCode::InvalidDestSemantic),
            _ => Ok(dest_f.join(rel)),
        }
    }
}

fn decide(policy: OverwritePolicy, incoming: &FileInfo, existing: &std::fs::Metadata) -> Decision {
    let newer = incoming
        .mtime
        .map(|m| m > crate::proto::mtime_secs(existing).unwrap_or(i64::MIN))
        .unwrap_or(false);
    let diff_size = incoming.size.map(|s| s != existing.len()).unwrap_or(true);
    match policy {
        OverwritePolicy::Prompt => Decision::Uncertain,
        OverwritePolicy::Yes => Decision::Accept,
        OverwritePolicy::No => Decision::Refuse,
        OverwritePolicy::NewerOnly if newer => Decision::Accept,
        OverwritePolicy::DiffSizeOnly if diff_size => Decision::Accept,
        OverwritePolicy::NewerOrDiffSize if newer || diff_size => Decision::Accept,
        _ => Decision::Refuse,
    }
}

/// Orphan candidates for sync mode. Entries keep parent-before-descendant
/// order (BTreeMap over path components), so the deletion pass can skip a
/// child once its parent is already gone.
#[derive(Default)]
struct SyncTable {
    entries: BTreeMap<PathBuf, ()>,
    scanned: HashSet<PathBuf>,
}

impl SyncTable {
    /// A directory counts as touched the first time any entry under it
    /// arrives, not only when the directory itself is an entry; its
    /// pre-existing descendants become deletion candidates. Every touch
    /// then protects the entry and its ancestors from later deletion.
    fn touch(&mut self, target: &Path, is_dir: bool) {
        if is_dir {
            self.seed(target);
        }
        if let Some(parent) = target.parent() {
            self.seed(parent);
        }
        for ancestor in target.ancestors() {
            self.entries.remove(ancestor);
        }
    }

    fn seed(&mut self, dir: &Path) {
        if !self.scanned.insert(dir.to_path_buf()) || !dir.is_dir() {
            return;
        }
        for ent in walkdir::WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            self.entries.insert(ent.path().to_path_buf(), ());
        }
    }

    fn delete_survivors(self, ctx: &TransferCtx, preview: bool) -> Vec<SyncResult> {
        let mut results = Vec::new();
        let mut last_deleted: Option<PathBuf> = None;
        for (path, _) in self.entries {
            if let Some(parent) = &last_deleted {
                if path.starts_with(parent) {
                    continue;
                }
            }
            let display = confine::display_path(ctx.sharing, &path);
            let is_dir = std::fs::symlink_metadata(&path)
                .map(|md| md.is_dir())
                .unwrap_or(false);
            if preview {
                if is_dir {
                    last_deleted = Some(path);
                }
                results.push(SyncResult {
                    path: display,
                    ok: true,
                    error: None,
                });
                continue;
            }
            let res = if is_dir {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match res {
                Ok(()) => {
                    eprintln!("[{}] sync rm {}", ctx.tag, display);
                    ctx.log.transfer(ctx.tag, "sync-rm", &display, 0);
                    if is_dir {
                        last_deleted = Some(path);
                    }
                    results.push(SyncResult {
                        path: display,
                        ok: true,
                        error: None,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // vanished on its own; counts as mirrored
                    results.push(SyncResult {
                        path: display,
                        ok: true,
                        error: None,
                    });
                }
                Err(e) => results.push(SyncResult {
                    path: display,
                    ok: false,
                    error: Some(e.to_string()),
                }),
            }
        }
        results
    }
}

pub fn serve_put(ctx: &TransferCtx, chan: &mut Channel, params: PutParams) -> Result<()> {
    chan.write_response(&Response::ok())?;

    let mut errors: Vec<ErrorDescriptor> = Vec::new();
    let mut outcome = true;
    let mut sync_table = SyncTable::default();
    let mut sync_requested = false;

    loop {
        let req = chan.read_request()?;
        let next = match Api::parse(&req.api) {
            Some(Api::PutNext) => match req.parse_params::<PutNextParams>() {
                Ok(p) => p,
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
        let info = match next.info {
            Some(i) => i,
            None => {
                // empty metadata ends the loop
                chan.write_response(&Response::ok())?;
                break;
            }
        };

        let target = match dest_target(ctx, &params, &info) {
            Ok(t) => t,
            Err(code) => {
                if code == ErrorCode::InvalidDestSemantic {
                    outcome = false;
                }
                errors.push(ErrorDescriptor::new(code, info.name.clone()));
                chan.write_response(&Response::err_subjects(
                    code,
                    vec![ErrorDescriptor::new(code, info.name)],
                ))?;
                continue;
            }
        };
        // dest_target joins sanitized components under a confined base;
        // re-resolve for symlinks planted inside the sharing.
        let target = match confine::allowed_real(ctx.sharing, &target) {
            Ok(t) => t,
            Err(code) => {
                errors.push(ErrorDescriptor::new(code, info.name.clone()));
                chan.write_response(&Response::err_subjects(
                    code,
                    vec![ErrorDescriptor::new(code, info.name)],
                ))?;
                continue;
            }
        };

        if next.sync {
            sync_requested = true;
            sync_table.touch(&target, info.is_dir());
        }

        if info.is_dir() {
            let already_existed = target.is_dir();
            if !params.preview {
                if let Err(e) = std::fs::create_dir_all(&target) {
                    let code = ErrorCode::from_io(&e);
                    errors.push(ErrorDescriptor::new(code, info.name.clone()));
                    chan.write_response(&Response::err_subjects(
                        code,
                        vec![ErrorDescriptor::new(code, info.name)],
                    ))?;
                    continue;
                }
            }
            chan.write_response(&Response::with_data(&PutNextReply {
                status: PutStatus::Accepted,
                already_existed,
                existing: None,
            })?)?;
            continue;
        }

        // file entry: negotiate against whatever already sits there
        let existing_md = std::fs::metadata(&target).ok().filter(|md| md.is_file());
        if let Some(emd) = &existing_md {
            match decide(next.policy, &info, emd) {
                Decision::Accept => {}
                Decision::Uncertain => {
                    let existing = FileInfo::from_metadata(emd, info.name.clone());
                    chan.write_response(&Response::with_data(&PutNextReply {
                        status: PutStatus::Uncertain,
                        already_existed: true,
                        existing: Some(existing),
                    })?)?;
                    continue;
                }
                Decision::Refuse => {
                    chan.write_response(&Response::with_data(&PutNextReply {
                        status: PutStatus::Refused,
                        already_existed: true,
                        existing: None,
                    })?)?;
                    continue;
                }
            }
        }

        if params.preview {
            chan.write_response(&Response::with_data(&PutNextReply {
                status: PutStatus::Accepted,
                already_existed: existing_md.is_some(),
                existing: None,
            })?)?;
            continue;
        }

        let file = match open_for_write(&target) {
            Ok(f) => f,
            Err(e) => {
                let code = ErrorCode::from_io(&e);
                errors.push(ErrorDescriptor::new(code, info.name.clone()));
                chan.write_response(&Response::err_subjects(
                    code,
                    vec![ErrorDescriptor::new(code, info.name)],
                ))?;
                continue;
            }
        };
        chan.write_response(&Response::with_data(&PutNextReply {
            status: PutStatus::Accepted,
            already_existed: existing_md.is_some(),
            existing: None,
        })?)?;

        let size = info.size.unwrap_or(0);
        let (crc, write_err) = receive_file(chan, file, size, ctx.chunk_size, params.check)?;
        if let Some(e) = &write_err {
            errors.push(ErrorDescriptor::new(ErrorCode::from_io(e), info.name.clone()));
        }
        if params.check {
            let mut trailer = [0u8; 4];
            chan.read_raw(&mut trailer)?;
            let sent = u32::from_be_bytes(trailer);
            let on_disk = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
            if Some(sent) != crc || on_disk != size {
                errors.push(ErrorDescriptor::new(ErrorCode::CheckFailed, info.name.clone()));
            }
        }
        if let Some(mtime) = info.mtime {
            let _ = filetime::set_file_mtime(&target, FileTime::from_unix_time(mtime, 0));
        }
        let shown = confine::display_path(ctx.sharing, &target);
        eprintln!("[{}] put {} ({} bytes)", ctx.tag, shown, size);
        ctx.log.transfer(ctx.tag, "put", &shown, size);
    }

    let sync_results = if sync_requested {
        Some(sync_table.delete_survivors(ctx, params.preview))
    } else {
        None
    };
    let summary = TransferSummary {
        outcome,
        errors,
        sync_results,
    };
    eprintln!(
        "[{}] put done outcome={} errors={}",
        ctx.tag,
        summary.outcome,
        summary.errors.len()
    );
    chan.write_response(&Response::with_data(&summary)?)
}

fn open_for_write(target: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(target)
}

/// Read exactly `size` raw bytes into `file`; returns the computed CRC32
/// when `check` is on. A local write failure still drains the declared
/// region so the channel survives.
fn receive_file(
    chan: &mut Channel,
    mut file: std::fs::File,
    size: u64,
    chunk_size: usize,
    check: bool,
) -> Result<(Option<u32>, Option<std::io::Error>)> {
    let mut crc = crc32fast::Hasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = size;
    let mut write_err: Option<std::io::Error> = None;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        chan.read_raw(&mut buf[..want])?;
        if check {
            crc.update(&buf[..want]);
        }
        // keep draining the declared region on failure, but report the
        // first write error to the caller
        if write_err.is_none() {
            if let Err(e) = file.write_all(&buf[..want]) {
                write_err = Some(e);
            }
        }
        remaining -= want as u64;
    }
    Ok((if check { Some(crc.finalize()) } else { None }, write_err))
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
            chunk_size: 4096,
            tag: "test",
            log: &crate::logger::NoopLogger,
        }
    }

    fn file_info(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            ftype: FileType::File,
            size: Some(3),
            mtime: Some(1_000),
        }
    }

    fn dir_info(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            ftype: FileType::Dir,
            size: None,
            mtime: None,
        }
    }

    fn put_params(dest: Option<&str>, is_multiple: bool) -> PutParams {
        PutParams {
            check: false,
            preview: false,
            dest: dest.map(str::to_string),
            is_multiple,
        }
    }

    #[test]
    fn test_dest_matrix_single_file() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        // no dest: written as its own name
        let t = dest_target(&c, &put_params(None, false), &file_info("a.txt")).unwrap();
        assert_eq!(t, root.join("a.txt"));

        // dest is an existing file: overwrite it
        std::fs::write(root.join("existing"), b"x").unwrap();
        let t = dest_target(&c, &put_params(Some("existing"), false), &file_info("a.txt")).unwrap();
        assert_eq!(t, root.join("existing"));

        // dest is a directory: place under it with the incoming basename
        std::fs::create_dir(root.join("d")).unwrap();
        let t = dest_target(&c, &put_params(Some("d"), false), &file_info("a.txt")).unwrap();
        assert_eq!(t, root.join("d/a.txt"));

        // dest missing: upload-as-rename
        let t = dest_target(&c, &put_params(Some("renamed"), false), &file_info("a.txt")).unwrap();
        assert_eq!(t, root.join("renamed"));
    }

    #[test]
    fn test_dest_matrix_directory_source() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);
        std::fs::write(root.join("plainfile"), b"x").unwrap();

        // directory onto an existing file is illegal
        assert!(matches!(
            dest_target(&c, &put_params(Some("plainfile"), false), &dir_info("tree")),
            Err(ErrorCode::InvalidDestSemantic)
        ));
        // nested names get the same treatment as directory entries
        assert!(matches!(
            dest_target(
                &c,
                &put_params(Some("plainfile"), false),
                &file_info("tree/inner.txt")
            ),
            Err(ErrorCode::InvalidDestSemantic)
        ));
        // dest existing or not, directories land under it
        let t = dest_target(&c, &put_params(Some("newdir"), false), &dir_info("tree")).unwrap();
        assert_eq!(t, root.join("newdir/tree"));
    }

    #[test]
    fn test_dest_matrix_multiple() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);
        std::fs::write(root.join("plainfile"), b"x").unwrap();
        std::fs::create_dir(root.join("d")).unwrap();

        // multiple sources demand an existing directory destination
        assert!(matches!(
            dest_target(&c, &put_params(Some("plainfile"), true), &file_info("a")),
            Err(ErrorCode::InvalidDestSemantic)
        ));
        assert!(matches!(
            dest_target(&c, &put_params(Some("missing"), true), &file_info("a")),
            Err(ErrorCode::InvalidDestSemantic)
        ));
        let t = dest_target(&c, &put_params(Some("d"), true), &file_info("a")).unwrap();
        assert_eq!(t, root.join("d/a"));
    }

    #[test]
    fn test_dest_rejects_traversal_names() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);
        assert!(matches!(
            dest_target(&c, &put_params(None, false), &file_info("../escape")),
            Err(ErrorCode::InvalidPath)
        ));
        assert!(matches!(
            dest_target(&c, &put_params(None, false), &file_info("/abs")),
            Err(ErrorCode::InvalidPath)
        ));
    }

    #[test]
    fn test_decide_policies() {
        let tmp = TempDir::new().unwrap();
        let existing = tmp.path().join("f");
        std::fs::write(&existing, b"12345").unwrap();
        filetime::set_file_mtime(&existing, FileTime::from_unix_time(1_000, 0)).unwrap();
        let emd = std::fs::metadata(&existing).unwrap();

        let mut incoming = FileInfo {
            name: "f".into(),
            ftype: FileType::File,
            size: Some(5),
            mtime: Some(1_000),
        };
        // same size, same mtime
        assert!(matches!(
            decide(OverwritePolicy::NewerOnly, &incoming, &emd),
            Decision::Refuse
        ));
        assert!(matches!(
            decide(OverwritePolicy::DiffSizeOnly, &incoming, &emd),
            Decision::Refuse
        ));
        assert!(matches!(
            decide(OverwritePolicy::Yes, &incoming, &emd),
            Decision::Accept
        ));
        assert!(matches!(
            decide(OverwritePolicy::No, &incoming, &emd),
            Decision::Refuse
        ));
        assert!(matches!(
            decide(OverwritePolicy::Prompt, &incoming, &emd),
            Decision::Uncertain
        ));

        incoming.mtime = Some(2_000);
        assert!(matches!(
            decide(OverwritePolicy::NewerOnly, &incoming, &emd),
            Decision::Accept
        ));
        assert!(matches!(
            decide(OverwritePolicy::NewerOrDiffSize, &incoming, &emd),
            Decision::Accept
        ));

        incoming.mtime = Some(500);
        incoming.size = Some(9);
        assert!(matches!(
            decide(OverwritePolicy::NewerOnly, &incoming, &emd),
            Decision::Refuse
        ));
        assert!(matches!(
            decide(OverwritePolicy::DiffSizeOnly, &incoming, &emd),
            Decision::Accept
        ));
    }

    #[test]
    fn test_sync_table_protects_touched_paths() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        let tree = root.join("tree");
        std::fs::create_dir_all(tree.join("keep")).unwrap();
        std::fs::write(tree.join("keep/k.txt"), b"k").unwrap();
        std::fs::write(tree.join("orphan.txt"), b"o").unwrap();

        let mut table = SyncTable::default();
        table.touch(&tree, true);
        table.touch(&tree.join("keep"), true);
        table.touch(&tree.join("keep/k.txt"), false);

        let results = table.delete_survivors(&c, false);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/tree/orphan.txt");
        assert!(results[0].ok);
        assert!(!tree.join("orphan.txt").exists());
        assert!(tree.join("keep/k.txt").exists());
    }

    #[test]
    fn test_sync_parent_short_circuit() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        let tree = root.join("tree");
        std::fs::create_dir_all(tree.join("gone/deep")).unwrap();
        std::fs::write(tree.join("gone/deep/a.txt"), b"a").unwrap();
        std::fs::write(tree.join("gone/b.txt"), b"b").unwrap();

        let mut table = SyncTable::default();
        table.touch(&tree, true);
        // nothing under "gone" arrives in the transfer

        let results = table.delete_survivors(&c, false);
        // exactly one deletion: the parent, not its descendants
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/tree/gone");
        assert!(!tree.join("gone").exists());
    }

    #[test]
    fn test_sync_table_seeds_parent_of_file_entries() {
        let tmp = TempDir::new().unwrap();
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let root = sharing.root.clone();
        let c = ctx(&sharing, &root);

        let dir = root.join("d");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), b"a").unwrap();
        std::fs::write(dir.join("orphan.txt"), b"o").unwrap();

        // plain files land directly in an existing directory; no
        // directory entry for "d" itself ever arrives
        let mut table = SyncTable::default();
        table.touch(&dir.join("a.txt"), false);
        table.touch(&dir.join("b.txt"), false);

        let results = table.delete_survivors(&c, false);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/d/orphan.txt");
        assert!(!dir.join("orphan.txt").exists());
        assert!(dir.join("a.txt").exists());
    }

    fn chan_pair() -> (Channel, Channel) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || listener.accept().unwrap().0);
        let client = std::net::TcpStream::connect(addr).unwrap();
        let server = join.join().unwrap();
        (Channel::new(client), Channel::new(server))
    }

    #[test]
    fn test_receive_file_reports_write_failures() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("t.bin");
        std::fs::write(&target, b"").unwrap();
        let readonly = std::fs::File::open(&target).unwrap();

        let (mut a, mut b) = chan_pair();
        a.write_raw(&[7u8; 64]).unwrap();

        let (crc, write_err) = receive_file(&mut b, readonly, 64, 16, false).unwrap();
        assert!(crc.is_none());
        assert!(write_err.is_some());
    }
}
