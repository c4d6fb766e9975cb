//! Client-side connection: the mirror of the server session, driving the
//! same operations and the client halves of the GET/PUT sub-protocols.

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::Channel;
use crate::confine;
use crate::proto::{
    Api, ErrorDescriptor, FileInfo, GetAction, GetNextParams, GetParams, OverwritePolicy,
    PutNextParams, PutNextReply, PutParams, PutStatus, Request, Response, ServerDescriptor,
    SharingInfo, TransferSummary, TreeNode, DEFAULT_CHUNK_SIZE,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub check: bool,
    pub no_hidden: bool,
    /// Abort the transfer after this many entries (used to cut a transfer
    /// short without dropping the connection).
    pub max_entries: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub check: bool,
    pub preview: bool,
    pub dest: Option<String>,
    pub sync: bool,
    pub policy: OverwritePolicy,
    /// Policy resent when the server answers `uncertain`; `Prompt` here
    /// degrades to `No`.
    pub conflict_fallback: OverwritePolicy,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            check: false,
            preview: false,
            dest: None,
            sync: false,
            policy: OverwritePolicy::Prompt,
            conflict_fallback: OverwritePolicy::No,
        }
    }
}

#[derive(Debug, Default)]
pub struct GetResult {
    pub summary: TransferSummary,
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    /// CRC/size mismatches detected locally, by entry name.
    pub check_failures: Vec<String>,
}

pub struct Connection {
    chan: Channel,
    chunk_size: usize,
}

impl Connection {
    pub fn dial(host: &str, port: u16) -> Result<Self> {
        let addr: SocketAddr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .next()
            .with_context(|| format!("no address for {}:{}", host, port))?;
        let chan = Channel::connect(&addr, CONNECT_TIMEOUT)?;
        Ok(Self {
            chan,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    fn call(&mut self, req: &Request) -> Result<Response> {
        self.chan.write_request(req)?;
        self.chan.read_response()
    }

    /// Call and insist on success; protocol errors become plain errors.
    fn call_ok(&mut self, req: &Request) -> Result<Response> {
        let resp = self.call(req)?;
        if !resp.success {
            bail!(
                "{} failed: {}",
                req.api,
                resp.error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(resp)
    }

    // ---- connection lifecycle ----

    pub fn connect(&mut self, password: &str) -> Result<()> {
        self.call_ok(&Request::with_params(
            Api::Connect,
            &serde_json::json!({ "password": password }),
        )?)?;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.call_ok(&Request::new(Api::Disconnect))?;
        Ok(())
    }

    pub fn ping(&mut self) -> Result<()> {
        self.call_ok(&Request::new(Api::Ping))?;
        Ok(())
    }

    pub fn info(&mut self) -> Result<ServerDescriptor> {
        let resp = self.call_ok(&Request::new(Api::Info))?;
        resp.parse_data()?.context("info carried no data")
    }

    pub fn list(&mut self) -> Result<Vec<SharingInfo>> {
        let resp = self.call_ok(&Request::new(Api::List))?;
        resp.parse_data()?.context("list carried no data")
    }

    pub fn open(&mut self, sharing: &str) -> Result<SharingInfo> {
        let resp = self.call_ok(&Request::with_params(
            Api::Open,
            &serde_json::json!({ "name": sharing }),
        )?)?;
        resp.parse_data()?.context("open carried no data")
    }

    pub fn close(&mut self) -> Result<()> {
        self.call_ok(&Request::new(Api::Close))?;
        Ok(())
    }

    // ---- directory commands ----

    pub fn rcd(&mut self, path: &str) -> Result<String> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rcd,
            &serde_json::json!({ "path": path }),
        )?)?;
        resp.parse_data()?.context("rcd carried no data")
    }

    pub fn rpwd(&mut self) -> Result<String> {
        let resp = self.call_ok(&Request::new(Api::Rpwd))?;
        resp.parse_data()?.context("rpwd carried no data")
    }

    pub fn rls(&mut self, path: Option<&str>, hidden: bool) -> Result<Vec<FileInfo>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rls,
            &serde_json::json!({ "path": path, "hidden": hidden }),
        )?)?;
        resp.parse_data()?.context("rls carried no data")
    }

    pub fn rtree(&mut self, path: Option<&str>, depth: Option<usize>) -> Result<Vec<TreeNode>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rtree,
            &serde_json::json!({ "path": path, "depth": depth }),
        )?)?;
        resp.parse_data()?.context("rtree carried no data")
    }

    pub fn rfind(&mut self, name: &str, path: Option<&str>) -> Result<Vec<String>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rfind,
            &serde_json::json!({ "name": name, "path": path }),
        )?)?;
        resp.parse_data()?.context("rfind carried no data")
    }

    pub fn rdu(&mut self, path: Option<&str>) -> Result<u64> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rdu,
            &serde_json::json!({ "path": path }),
        )?)?;
        resp.parse_data()?.context("rdu carried no data")
    }

    pub fn rmkdir(&mut self, path: &str) -> Result<()> {
        self.call_ok(&Request::with_params(
            Api::Rmkdir,
            &serde_json::json!({ "path": path }),
        )?)?;
        Ok(())
    }

    /// Best-effort batch remove; per-path failures come back in the list.
    pub fn rrm(&mut self, paths: &[String]) -> Result<Vec<ErrorDescriptor>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rrm,
            &serde_json::json!({ "paths": paths }),
        )?)?;
        Ok(resp.errors.unwrap_or_default())
    }

    pub fn rmv(&mut self, sources: &[String], dest: &str) -> Result<Vec<ErrorDescriptor>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rmv,
            &serde_json::json!({ "sources": sources, "dest": dest }),
        )?)?;
        Ok(resp.errors.unwrap_or_default())
    }

    pub fn rcp(&mut self, sources: &[String], dest: &str) -> Result<Vec<ErrorDescriptor>> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rcp,
            &serde_json::json!({ "sources": sources, "dest": dest }),
        )?)?;
        Ok(resp.errors.unwrap_or_default())
    }

    pub fn rstat(&mut self, paths: &[String]) -> Result<(Vec<FileInfo>, Vec<ErrorDescriptor>)> {
        let resp = self.call_ok(&Request::with_params(
            Api::Rstat,
            &serde_json::json!({ "paths": paths }),
        )?)?;
        let infos = resp.parse_data()?.unwrap_or_default();
        Ok((infos, resp.errors.unwrap_or_default()))
    }

    // ---- GET (pull) ----

    /// Pull `paths` into `dest_dir`, reproducing the remote layout.
    /// Server-supplied names are sanitized before touching the local
    /// disk, the same defense the server applies to SPaths.
    pub fn get(
        &mut self,
        paths: &[String],
        dest_dir: &Path,
        opts: &GetOptions,
        mut on_entry: impl FnMut(&FileInfo),
    ) -> Result<GetResult> {
        self.call_ok(&Request::with_params(
            Api::Get,
            &GetParams {
                paths: paths.to_vec(),
                check: opts.check,
                no_hidden: opts.no_hidden,
            },
        )?)?;

        let mut result = GetResult::default();
        let mut entries_seen: u64 = 0;
        loop {
            if opts
                .max_entries
                .map(|max| entries_seen >= max)
                .unwrap_or(false)
            {
                self.chan.write_request(&Request::with_params(
                    Api::GetNext,
                    &GetNextParams {
                        action: GetAction::Abort,
                    },
                )?)?;
                break;
            }
            self.chan.write_request(&Request::with_params(
                Api::GetNext,
                &GetNextParams {
                    action: GetAction::Transfer,
                },
            )?)?;
            let resp = self.chan.read_response()?;
            if !resp.success {
                // per-entry failure, already recorded in the summary
                continue;
            }
            let info: Option<FileInfo> = resp.parse_data()?;
            let info = match info {
                Some(i) => i,
                None => break, // terminal empty success
            };
            entries_seen += 1;
            on_entry(&info);
            let rel = confine::safe_relative(&info.name)
                .with_context(|| format!("unsafe remote name {:?}", info.name))?;
            let target = dest_dir.join(rel);
            if info.is_dir() {
                std::fs::create_dir_all(&target)?;
                result.dirs += 1;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let size = info.size.unwrap_or(0);
            let mut file = std::fs::File::create(&target)
                .with_context(|| format!("create {}", target.display()))?;
            let mut crc = crc32fast::Hasher::new();
            let mut buf = vec![0u8; self.chunk_size];
            let mut remaining = size;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                self.chan.read_raw(&mut buf[..want])?;
                if opts.check {
                    crc.update(&buf[..want]);
                }
                file.write_all(&buf[..want])?;
                remaining -= want as u64;
            }
            if opts.check {
                let mut trailer = [0u8; 4];
                self.chan.read_raw(&mut trailer)?;
                if u32::from_be_bytes(trailer) != crc.finalize() {
                    result.check_failures.push(info.name.clone());
                }
            }
            drop(file);
            if let Some(mtime) = info.mtime {
                let _ = filetime::set_file_mtime(&target, FileTime::from_unix_time(mtime, 0));
            }
            result.files += 1;
            result.bytes += size;
        }

        let summary = self
            .chan
            .read_response()?
            .parse_data()?
            .context("get ended without a summary")?;
        result.summary = summary;
        Ok(result)
    }

    // ---- PUT (push) ----

    /// Push local `sources` (files or directory trees) to the server.
    pub fn put(
        &mut self,
        sources: &[PathBuf],
        opts: &PutOptions,
        mut on_entry: impl FnMut(&FileInfo),
    ) -> Result<TransferSummary> {
        self.call_ok(&Request::with_params(
            Api::Put,
            &PutParams {
                check: opts.check,
                preview: opts.preview,
                dest: opts.dest.clone(),
                is_multiple: sources.len() > 1,
            },
        )?)?;

        for source in sources {
            let md = std::fs::metadata(source)
                .with_context(|| format!("source {}", source.display()))?;
            let base_name = source
                .file_name()
                .context("source path has no basename")?
                .to_string_lossy()
                .into_owned();
            if md.is_file() {
                let info = FileInfo::from_metadata(&md, base_name);
                on_entry(&info);
                self.put_entry(source, &info, opts)?;
                continue;
            }
            // directory tree, pre-order so parents precede children
            for ent in walkdir::WalkDir::new(source)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let rel = ent
                    .path()
                    .strip_prefix(source)
                    .unwrap_or_else(|_| Path::new(""));
                let name = if rel.as_os_str().is_empty() {
                    base_name.clone()
                } else {
                    format!("{}/{}", base_name, rel.display())
                };
                let emd = match ent.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if !emd.is_file() && !emd.is_dir() {
                    continue;
                }
                let info = FileInfo::from_metadata(&emd, name);
                on_entry(&info);
                self.put_entry(ent.path(), &info, opts)?;
            }
        }

        // empty metadata terminates the loop
        self.chan
            .write_request(&Request::with_params(
                Api::PutNext,
                &PutNextParams {
                    info: None,
                    policy: opts.policy,
                    sync: opts.sync,
                },
            )?)?;
        let end = self.chan.read_response()?;
        if !end.success {
            bail!("put terminator rejected");
        }
        self.chan
            .read_response()?
            .parse_data()?
            .context("put ended without a summary")
    }

    fn put_entry(&mut self, local: &Path, info: &FileInfo, opts: &PutOptions) -> Result<()> {
        let mut policy = opts.policy;
        loop {
            self.chan.write_request(&Request::with_params(
                Api::PutNext,
                &PutNextParams {
                    info: Some(info.clone()),
                    policy,
                    sync: opts.sync,
                },
            )?)?;
            let resp = self.chan.read_response()?;
            if !resp.success {
                // semantic or I/O refusal, recorded in the final summary
                return Ok(());
            }
            let reply: PutNextReply = resp
                .parse_data()?
                .context("putNext reply carried no data")?;
            match reply.status {
                PutStatus::Refused => return Ok(()),
                PutStatus::Uncertain => {
                    let fallback = match opts.conflict_fallback {
                        OverwritePolicy::Prompt => OverwritePolicy::No,
                        p => p,
                    };
                    if policy == fallback {
                        // server keeps asking; give up on this entry
                        return Ok(());
                    }
                    policy = fallback;
                }
                PutStatus::Accepted => {
                    if !info.is_dir() && !opts.preview {
                        self.stream_file(local, info.size.unwrap_or(0), opts.check)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn stream_file(&mut self, local: &Path, size: u64, check: bool) -> Result<()> {
        let mut file = std::fs::File::open(local)?;
        let mut crc = crc32fast::Hasher::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            // honor the declared size even if the file shrank underneath
            let n = match file.read(&mut buf[..want]) {
                Ok(0) | Err(_) => {
                    buf[..want].fill(0);
                    want
                }
                Ok(n) => n,
            };
            if check {
                crc.update(&buf[..n]);
            }
            self.chan.write_raw(&buf[..n])?;
            remaining -= n as u64;
        }
        if check {
            self.chan.write_raw(&crc.finalize().to_be_bytes())?;
        }
        Ok(())
    }
}
