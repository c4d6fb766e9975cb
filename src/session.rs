//! Per-connection session: state machine, guard chain and command dispatch
//!
//! One session per connected client, owned exclusively by that client's
//! worker thread. Requests are strictly sequential; the GET/PUT handlers
//! temporarily take over the channel for their sub-protocol loops.

use anyhow::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::channel::{closed_by_peer, Channel};
use crate::confine;
use crate::logger::Logger;
use crate::proto::{
    Api, ErrorCode, ErrorDescriptor, FileInfo, Request, Response, ServerDescriptor, TreeNode,
};
use crate::sharing::{ServerConfig, Sharing};
use crate::{get, put};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticated,
    Disconnected,
}

/// Borrowed view handed to the GET/PUT engines.
pub struct TransferCtx<'a> {
    pub sharing: &'a Sharing,
    pub rcwd: &'a Path,
    pub chunk_size: usize,
    pub tag: &'a str,
    pub log: &'a dyn Logger,
}

pub struct Session<'a> {
    config: &'a ServerConfig,
    endpoint: SocketAddr,
    tag: String,
    auth: AuthState,
    sharing: Option<&'a Sharing>,
    rcwd: PathBuf,
}

#[derive(Deserialize)]
struct ConnectParams {
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct OpenParams {
    name: String,
}

#[derive(Deserialize, Default)]
struct PathParams {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    hidden: bool,
}

#[derive(Deserialize, Default)]
struct TreeParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    hidden: bool,
}

#[derive(Deserialize)]
struct FindParams {
    name: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize, Default)]
struct PathsParams {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct TwoPlusParams {
    sources: Vec<String>,
    dest: String,
}

#[derive(Clone, Copy)]
enum MvCp {
    Move,
    Copy,
}

impl MvCp {
    fn verb(self) -> &'static str {
        match self {
            MvCp::Move => "mv",
            MvCp::Copy => "cp",
        }
    }
}

impl<'a> Session<'a> {
    pub fn new(config: &'a ServerConfig, endpoint: SocketAddr) -> Self {
        let tag = uuid::Uuid::new_v4().to_string()[..8].to_string();
        Self {
            config,
            endpoint,
            tag,
            auth: AuthState::Anonymous,
            sharing: None,
            rcwd: PathBuf::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Serve requests until the peer disconnects or the channel closes.
    pub fn run(&mut self, chan: &mut Channel) -> Result<()> {
        eprintln!("[{}] session from {}", self.tag, self.endpoint);
        self.config.logger.session(&self.tag, &self.endpoint.to_string());
        loop {
            let req = match chan.read_request() {
                Ok(r) => r,
                Err(e) if closed_by_peer(&e) => {
                    eprintln!("[{}] peer closed", self.tag);
                    return Ok(());
                }
                Err(e) => {
                    // Malformed JSON after a complete frame is a protocol
                    // error fatal to the request, not the connection.
                    if e.downcast_ref::<serde_json::Error>().is_some()
                        || e.to_string().contains("malformed request")
                    {
                        chan.write_response(&Response::err(ErrorCode::InvalidRequest))?;
                        continue;
                    }
                    return Err(e);
                }
            };
            self.dispatch(chan, req)?;
            if self.auth == AuthState::Disconnected {
                eprintln!("[{}] disconnected", self.tag);
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, chan: &mut Channel, req: Request) -> Result<()> {
        let api = match Api::parse(&req.api) {
            Some(a) => a,
            None => {
                eprintln!("[{}] unknown api {:?}", self.tag, req.api);
                return chan.write_response(&Response::err(ErrorCode::UnknownApi));
            }
        };
        match api {
            // Sub-protocols own the channel for their whole exchange.
            Api::Get => self.handle_get(chan, &req),
            Api::Put => self.handle_put(chan, &req),
            // A stray next outside its sub-protocol is a protocol error.
            Api::GetNext | Api::PutNext => {
                chan.write_response(&Response::err(ErrorCode::InvalidRequest))
            }
            _ => {
                let resp = self
                    .handle_simple(api, &req)
                    .unwrap_or_else(|e| {
                        eprintln!("[{}] {} failed: {:#}", self.tag, req.api, e);
                        Response::err(ErrorCode::CommandExecutionFailed)
                    });
                chan.write_response(&resp)
            }
        }
    }

    fn handle_simple(&mut self, api: Api, req: &Request) -> Result<Response> {
        Ok(match api {
            Api::Connect => self.connect(req),
            Api::Disconnect => self.disconnect(),
            Api::Info => Response::with_data(&self.descriptor())?,
            Api::List => Response::with_data(
                &self
                    .config
                    .sharings
                    .iter()
                    .map(|s| s.info())
                    .collect::<Vec<_>>(),
            )?,
            Api::Ping => Response::with_data(&"pong")?,
            Api::Open => self.open(req)?,
            Api::Close => self.close(),
            Api::Rcd => self.rcd(req)?,
            Api::Rpwd => self.rpwd()?,
            Api::Rls => self.rls(req)?,
            Api::Rtree => self.rtree(req)?,
            Api::Rfind => self.rfind(req)?,
            Api::Rdu => self.rdu(req)?,
            Api::Rmkdir => self.rmkdir(req)?,
            Api::Rrm => self.rrm(req)?,
            Api::Rmv => self.mv_cp(req, MvCp::Move)?,
            Api::Rcp => self.mv_cp(req, MvCp::Copy)?,
            Api::Rstat => self.rstat(req)?,
            Api::Get | Api::Put | Api::GetNext | Api::PutNext => unreachable!(),
        })
    }

    // ---- guards, checked in order and short-circuiting ----

    fn require_authenticated(&self) -> Result<(), ErrorCode> {
        match self.auth {
            AuthState::Authenticated => Ok(()),
            _ => Err(ErrorCode::NotConnected),
        }
    }

    fn require_open(&self) -> Result<&'a Sharing, ErrorCode> {
        self.require_authenticated()?;
        self.sharing.ok_or(ErrorCode::SharingNotOpen)
    }

    fn require_directory(&self) -> Result<&'a Sharing, ErrorCode> {
        let sharing = self.require_open()?;
        if sharing.is_directory() {
            Ok(sharing)
        } else {
            Err(ErrorCode::NotADirectory)
        }
    }

    fn require_writable(&self) -> Result<&'a Sharing, ErrorCode> {
        let sharing = self.require_directory()?;
        if sharing.read_only {
            Err(ErrorCode::NotWritable)
        } else {
            Ok(sharing)
        }
    }

    // ---- connection lifecycle ----

    fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            name: self.config.name.clone(),
            port: self.config.port(),
            auth: self.config.auth.required(),
            sharings: self.config.sharings.iter().map(|s| s.info()).collect(),
            addr: None,
        }
    }

    fn connect(&mut self, req: &Request) -> Response {
        if self.auth == AuthState::Authenticated {
            return Response::ok();
        }
        let params: ConnectParams = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return Response::err(ErrorCode::InvalidRequest),
        };
        if self.config.auth.authenticate(&params.password) {
            self.auth = AuthState::Authenticated;
            eprintln!("[{}] authenticated", self.tag);
            Response::ok()
        } else {
            eprintln!("[{}] authentication failed", self.tag);
            Response::err(ErrorCode::AuthenticationFailed)
        }
    }

    fn disconnect(&mut self) -> Response {
        if let Err(e) = self.require_authenticated() {
            return Response::err(e);
        }
        self.auth = AuthState::Disconnected;
        self.sharing = None;
        self.rcwd = PathBuf::new();
        Response::ok()
    }

    fn open(&mut self, req: &Request) -> Result<Response> {
        if let Err(e) = self.require_authenticated() {
            return Ok(Response::err(e));
        }
        let params: OpenParams = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return Ok(Response::err(ErrorCode::InvalidRequest)),
        };
        let sharing = match self.config.sharing(&params.name) {
            Some(s) => s,
            None => return Ok(Response::err(ErrorCode::SharingNotFound)),
        };
        self.sharing = Some(sharing);
        self.rcwd = sharing.root.clone();
        eprintln!("[{}] open sharing {:?}", self.tag, sharing.name);
        self.config
            .logger
            .command(&self.tag, &format!("open {}", sharing.name));
        Response::with_data(&sharing.info()).map_err(Into::into)
    }

    fn close(&mut self) -> Response {
        if let Err(e) = self.require_open().map(|_| ()) {
            return Response::err(e);
        }
        eprintln!("[{}] close sharing", self.tag);
        self.sharing = None;
        self.rcwd = PathBuf::new();
        Response::ok()
    }

    // ---- directory commands ----

    fn rcd(&mut self, req: &Request) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: PathParams = req.parse_params().unwrap_or_default();
        let spath = params.path.unwrap_or_else(|| "/".to_string());
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Response::err_subjects(
                    e,
                    vec![ErrorDescriptor::new(e, spath)],
                ))
            }
        };
        match std::fs::metadata(&fpath) {
            Ok(md) if md.is_dir() => {}
            Ok(_) => {
                return Ok(Response::err_subjects(
                    ErrorCode::NotADirectory,
                    vec![ErrorDescriptor::new(ErrorCode::NotADirectory, spath)],
                ))
            }
            Err(_) => {
                return Ok(Response::err_subjects(
                    ErrorCode::NotExists,
                    vec![ErrorDescriptor::new(ErrorCode::NotExists, spath)],
                ))
            }
        }
        self.rcwd = fpath;
        Response::with_data(&confine::display_path(sharing, &self.rcwd)).map_err(Into::into)
    }

    fn rpwd(&self) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        Response::with_data(&confine::display_path(sharing, &self.rcwd)).map_err(Into::into)
    }

    fn rls(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: ListParams = req.parse_params().unwrap_or_default();
        let spath = params.path.unwrap_or_else(|| ".".to_string());
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => return Ok(Response::err(e)),
        };
        let mut entries = Vec::new();
        for ent in std::fs::read_dir(&fpath)? {
            let ent = ent?;
            if !params.hidden && confine::is_hidden(&ent.file_name()) {
                continue;
            }
            let name = ent.file_name().to_string_lossy().into_owned();
            if let Ok(md) = ent.metadata() {
                entries.push(FileInfo::from_metadata(&md, name));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Response::with_data(&entries).map_err(Into::into)
    }

    fn rtree(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: TreeParams = req.parse_params().unwrap_or_default();
        let spath = params.path.unwrap_or_else(|| ".".to_string());
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => return Ok(Response::err(e)),
        };
        let mut walker = walkdir::WalkDir::new(&fpath).min_depth(1).follow_links(false);
        if let Some(depth) = params.depth {
            walker = walker.max_depth(depth.max(1));
        }
        let mut nodes = Vec::new();
        let mut it = walker.into_iter();
        while let Some(ent) = it.next() {
            let ent = match ent {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !params.hidden && confine::is_hidden(ent.file_name()) {
                if ent.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }
            let name = ent.file_name().to_string_lossy().into_owned();
            if let Ok(md) = ent.metadata() {
                nodes.push(TreeNode {
                    info: FileInfo::from_metadata(&md, name),
                    depth: ent.depth(),
                });
            }
        }
        Response::with_data(&nodes).map_err(Into::into)
    }

    fn rfind(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: FindParams = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return Ok(Response::err(ErrorCode::InvalidRequest)),
        };
        let spath = params.path.unwrap_or_else(|| ".".to_string());
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => return Ok(Response::err(e)),
        };
        let needle = params.name.to_lowercase();
        let mut matches = Vec::new();
        for ent in walkdir::WalkDir::new(&fpath)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = ent.file_name().to_string_lossy().to_lowercase();
            if name.contains(&needle) {
                matches.push(confine::display_path(sharing, ent.path()));
            }
        }
        Response::with_data(&matches).map_err(Into::into)
    }

    fn rdu(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_directory() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: PathParams = req.parse_params().unwrap_or_default();
        let spath = params.path.unwrap_or_else(|| ".".to_string());
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => return Ok(Response::err(e)),
        };
        let mut used: u64 = 0;
        for ent in walkdir::WalkDir::new(&fpath)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if ent.file_type().is_file() {
                used += ent.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Response::with_data(&used).map_err(Into::into)
    }

    fn rmkdir(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_writable() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: PathParams = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return Ok(Response::err(ErrorCode::InvalidRequest)),
        };
        let spath = match params.path {
            Some(p) => p,
            None => return Ok(Response::err(ErrorCode::InvalidRequest)),
        };
        let fpath = match confine::resolve_allowed(sharing, &self.rcwd, &spath) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Response::err_subjects(
                    e,
                    vec![ErrorDescriptor::new(e, spath)],
                ))
            }
        };
        if let Err(e) = std::fs::create_dir_all(&fpath) {
            let code = ErrorCode::from_io(&e);
            return Ok(Response::err_subjects(
                code,
                vec![ErrorDescriptor::new(code, spath)],
            ));
        }
        let shown = confine::display_path(sharing, &fpath);
        eprintln!("[{}] mkdir {}", self.tag, shown);
        self.config.logger.command(&self.tag, &format!("mkdir {}", shown));
        Ok(Response::ok())
    }

    /// Best-effort batch removal: failures land in `errors`, the rest are
    /// actually removed.
    fn rrm(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_writable() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: PathsParams = req.parse_params().unwrap_or_default();
        if params.paths.is_empty() {
            return Ok(Response::err(ErrorCode::InvalidRequest));
        }
        let mut errors = Vec::new();
        for spath in &params.paths {
            let fpath = match confine::resolve_allowed(sharing, &self.rcwd, spath) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(ErrorDescriptor::new(e, spath.clone()));
                    continue;
                }
            };
            if fpath == sharing.root {
                errors.push(ErrorDescriptor::new(ErrorCode::InvalidPath, spath.clone()));
                continue;
            }
            let res = match std::fs::symlink_metadata(&fpath) {
                Ok(md) if md.is_dir() => std::fs::remove_dir_all(&fpath),
                Ok(_) => std::fs::remove_file(&fpath),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => {
                    let shown = confine::display_path(sharing, &fpath);
                    eprintln!("[{}] rm {}", self.tag, shown);
                    self.config.logger.command(&self.tag, &format!("rm {}", shown));
                }
                Err(e) => errors.push(ErrorDescriptor::new(ErrorCode::from_io(&e), spath.clone())),
            }
        }
        Ok(Response {
            success: true,
            data: None,
            error: None,
            errors: if errors.is_empty() { None } else { Some(errors) },
        })
    }

    fn mv_cp(&self, req: &Request, op: MvCp) -> Result<Response> {
        let sharing = match self.require_writable() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: TwoPlusParams = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return Ok(Response::err(ErrorCode::InvalidRequest)),
        };
        if params.sources.is_empty() {
            return Ok(Response::err(ErrorCode::InvalidRequest));
        }
        let dest_f = match confine::resolve_allowed(sharing, &self.rcwd, &params.dest) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Response::err_subjects(
                    e,
                    vec![ErrorDescriptor::new(e, params.dest.clone())],
                ))
            }
        };
        let dest_md = std::fs::metadata(&dest_f).ok();
        // With multiple sources the destination must already be a
        // directory; fail before touching any source.
        if params.sources.len() >= 2 {
            match &dest_md {
                None => {
                    return Ok(Response::err_subjects(
                        ErrorCode::NotExists,
                        vec![ErrorDescriptor::new(ErrorCode::NotExists, params.dest.clone())],
                    ))
                }
                Some(md) if !md.is_dir() => {
                    return Ok(Response::err_subjects(
                        ErrorCode::NotADirectory,
                        vec![ErrorDescriptor::new(
                            ErrorCode::NotADirectory,
                            params.dest.clone(),
                        )],
                    ))
                }
                _ => {}
            }
        }
        let dest_is_dir = dest_md.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        let mut errors = Vec::new();
        for spath in &params.sources {
            let src_f = match confine::resolve_allowed(sharing, &self.rcwd, spath) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(ErrorDescriptor::new(e, spath.clone()));
                    continue;
                }
            };
            let src_md = match std::fs::metadata(&src_f) {
                Ok(md) => md,
                Err(e) => {
                    errors.push(ErrorDescriptor::new(ErrorCode::from_io(&e), spath.clone()));
                    continue;
                }
            };
            // Destination type determines semantics: wrap into a
            // directory; overwrite a file with a file; a directory can
            // never land on a file.
            let target = if dest_is_dir {
                match src_f.file_name() {
                    Some(n) => dest_f.join(n),
                    None => {
                        errors.push(ErrorDescriptor::new(ErrorCode::InvalidPath, spath.clone()));
                        continue;
                    }
                }
            } else if dest_md.is_some() && src_md.is_dir() {
                errors.push(ErrorDescriptor::new(
                    ErrorCode::NotADirectory,
                    params.dest.clone(),
                ));
                continue;
            } else {
                dest_f.clone()
            };
            let res = match op {
                MvCp::Move => std::fs::rename(&src_f, &target),
                MvCp::Copy => {
                    if src_md.is_dir() {
                        copy_tree(&src_f, &target)
                    } else {
                        std::fs::copy(&src_f, &target).map(|_| ())
                    }
                }
            };
            match res {
                Ok(()) => {
                    let line = format!(
                        "{} {} -> {}",
                        op.verb(),
                        confine::display_path(sharing, &src_f),
                        confine::display_path(sharing, &target)
                    );
                    eprintln!("[{}] {}", self.tag, line);
                    self.config.logger.command(&self.tag, &line);
                }
                Err(e) => errors.push(ErrorDescriptor::new(ErrorCode::from_io(&e), spath.clone())),
            }
        }
        Ok(Response {
            success: true,
            data: None,
            error: None,
            errors: if errors.is_empty() { None } else { Some(errors) },
        })
    }

    fn rstat(&self, req: &Request) -> Result<Response> {
        let sharing = match self.require_open() {
            Ok(s) => s,
            Err(e) => return Ok(Response::err(e)),
        };
        let params: PathsParams = req.parse_params().unwrap_or_default();
        let paths = if params.paths.is_empty() {
            vec![".".to_string()]
        } else {
            params.paths
        };
        let mut infos = Vec::new();
        let mut errors = Vec::new();
        for spath in &paths {
            let fpath = match confine::resolve_allowed(sharing, &self.rcwd, spath) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(ErrorDescriptor::new(e, spath.clone()));
                    continue;
                }
            };
            match std::fs::metadata(&fpath) {
                Ok(md) => infos.push(FileInfo::from_metadata(
                    &md,
                    confine::display_path(sharing, &fpath),
                )),
                Err(_) => errors.push(ErrorDescriptor::new(ErrorCode::NotExists, spath.clone())),
            }
        }
        Ok(Response {
            success: true,
            data: Some(serde_json::to_value(&infos)?),
            error: None,
            errors: if errors.is_empty() { None } else { Some(errors) },
        })
    }

    // ---- transfer sub-protocols ----

    fn handle_get(&mut self, chan: &mut Channel, req: &Request) -> Result<()> {
        let sharing = match self.require_open() {
            Ok(s) => s,
            Err(e) => return chan.write_response(&Response::err(e)),
        };
        let params = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return chan.write_response(&Response::err(ErrorCode::InvalidRequest)),
        };
        let ctx = TransferCtx {
            sharing,
            rcwd: &self.rcwd,
            chunk_size: self.config.chunk_size,
            tag: &self.tag,
            log: self.config.logger.as_ref(),
        };
        get::serve_get(&ctx, chan, params)
    }

    fn handle_put(&mut self, chan: &mut Channel, req: &Request) -> Result<()> {
        let sharing = match self.require_writable() {
            Ok(s) => s,
            Err(e) => return chan.write_response(&Response::err(e)),
        };
        let params = match req.parse_params() {
            Ok(p) => p,
            Err(_) => return chan.write_response(&Response::err(ErrorCode::InvalidRequest)),
        };
        let ctx = TransferCtx {
            sharing,
            rcwd: &self.rcwd,
            chunk_size: self.config.chunk_size,
            tag: &self.tag,
            log: self.config.logger.as_ref(),
        };
        put::serve_put(&ctx, chan, params)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for ent in std::fs::read_dir(src)? {
        let ent = ent?;
        let target = dst.join(ent.file_name());
        let ft = ent.file_type()?;
        if ft.is_dir() {
            copy_tree(&ent.path(), &target)?;
        } else {
            std::fs::copy(ent.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::{ServerConfig, SharedSecret, Sharing};
    use std::sync::Arc;

    fn config(tmp: &tempfile::TempDir) -> ServerConfig {
        let sharing = Sharing::new("s", tmp.path(), false).unwrap();
        let mut cfg = ServerConfig::new(vec![sharing]);
        cfg.auth = Arc::new(SharedSecret::new("pw"));
        cfg
    }

    fn endpoint() -> SocketAddr {
        "127.0.0.1:4242".parse().unwrap()
    }

    #[test]
    fn test_guard_order() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(&tmp);
        let mut session = Session::new(&cfg, endpoint());

        // anonymous: auth guard fires first
        assert_eq!(session.require_open().unwrap_err(), ErrorCode::NotConnected);
        assert_eq!(
            session.require_writable().unwrap_err(),
            ErrorCode::NotConnected
        );

        session.auth = AuthState::Authenticated;
        assert_eq!(session.require_open().unwrap_err(), ErrorCode::SharingNotOpen);

        session.sharing = Some(&cfg.sharings[0]);
        session.rcwd = cfg.sharings[0].root.clone();
        assert!(session.require_writable().is_ok());
    }

    #[test]
    fn test_readonly_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let sharing = Sharing::new("ro", tmp.path(), true).unwrap();
        let cfg = ServerConfig::new(vec![sharing]);
        let mut session = Session::new(&cfg, endpoint());
        session.auth = AuthState::Authenticated;
        session.sharing = Some(&cfg.sharings[0]);
        session.rcwd = cfg.sharings[0].root.clone();
        assert_eq!(session.require_writable().unwrap_err(), ErrorCode::NotWritable);
        // read side still fine
        assert!(session.require_directory().is_ok());
    }

    #[test]
    fn test_file_sharing_rejects_directory_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("one.bin");
        std::fs::write(&f, b"x").unwrap();
        let sharing = Sharing::new("one", &f, false).unwrap();
        let cfg = ServerConfig::new(vec![sharing]);
        let mut session = Session::new(&cfg, endpoint());
        session.auth = AuthState::Authenticated;
        session.sharing = Some(&cfg.sharings[0]);
        session.rcwd = cfg.sharings[0].root.clone();
        assert_eq!(
            session.require_directory().unwrap_err(),
            ErrorCode::NotADirectory
        );
        // stat stays legal on a file sharing
        assert!(session.require_open().is_ok());
    }

    #[test]
    fn test_connect_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(&tmp);
        let mut session = Session::new(&cfg, endpoint());

        let bad = Request::with_params(Api::Connect, &serde_json::json!({"password": "nope"}))
            .unwrap();
        let resp = session.connect(&bad);
        assert_eq!(resp.error, Some(ErrorCode::AuthenticationFailed));
        assert_eq!(session.auth, AuthState::Anonymous);

        let good =
            Request::with_params(Api::Connect, &serde_json::json!({"password": "pw"})).unwrap();
        assert!(session.connect(&good).success);
        assert_eq!(session.auth, AuthState::Authenticated);

        // idempotent once authenticated
        assert!(session.connect(&bad).success);
    }
}
