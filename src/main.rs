//! skiff - client for skiff file servers
//!
//! Talks to a skiffd daemon over the framed session protocol: browse
//! sharings, run remote filesystem commands, and transfer trees with
//! optional CRC checking and one-way sync.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use skiff::client::{Connection, GetOptions, PutOptions};
use skiff::discovery;
use skiff::proto::{ErrorDescriptor, OverwritePolicy};
use skiff::url::{parse_remote_url, RemoteUrl};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "skiff - browse and transfer files from skiff servers"
)]
struct Args {
    /// Server url (skiff://host[:port][/sharing[/path]]); not needed for scan
    url: Option<String>,

    /// Password for servers that require one
    #[arg(long, default_value = "")]
    password: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover skiff servers on the local network
    Scan {
        /// Discovery port to probe
        #[arg(long)]
        port: Option<u16>,
        /// How long to listen for replies, in seconds
        #[arg(long, default_value_t = 2)]
        timeout: u64,
    },
    /// Show server name and sharings
    Info,
    /// List the sharings a server offers
    List,
    /// List a remote directory
    Ls {
        path: Option<String>,
        /// Include dot-prefixed entries
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Print a remote directory tree
    Tree {
        path: Option<String>,
        /// Limit recursion depth
        #[arg(short = 'd', long)]
        depth: Option<usize>,
    },
    /// Find remote entries whose name contains a substring
    Find { name: String, path: Option<String> },
    /// Total size in bytes of a remote subtree
    Du { path: Option<String> },
    /// Create a remote directory
    Mkdir { path: String },
    /// Remove remote files or directories
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Move remote entries (last path is the destination)
    Mv {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
    },
    /// Copy remote entries (last path is the destination)
    Cp {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
    },
    /// Show metadata for remote paths
    Stat {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Download remote paths into a local directory
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Local destination directory
        #[arg(short = 'o', long, default_value = ".")]
        out: PathBuf,
        /// Verify transfers with CRC32 trailers
        #[arg(long)]
        check: bool,
        /// Skip dot-prefixed entries
        #[arg(long)]
        no_hidden: bool,
    },
    /// Upload local paths into the opened sharing
    Put {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Remote destination (defaults to the remote working directory)
        #[arg(short = 'd', long)]
        dest: Option<String>,
        /// Verify transfers with CRC32 trailers
        #[arg(long)]
        check: bool,
        /// Overwrite policy: yes, no, newerOnly, diffSizeOnly, newerOrDiffSize
        #[arg(long, default_value = "newerOrDiffSize")]
        overwrite: String,
        /// Delete server-side entries absent from the upload
        #[arg(long)]
        sync: bool,
        /// Report what would change without writing or deleting
        #[arg(long)]
        preview: bool,
    },
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("skiff: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Scan { port, timeout } = &args.command {
        return scan(*port, *timeout);
    }

    let url = args
        .url
        .as_deref()
        .context("a server url is required (skiff://host[:port][/sharing])")?;
    let url = parse_remote_url(url)
        .context("invalid url, expected skiff://host[:port][/sharing[/path]]")?;

    let mut conn = Connection::dial(&url.host, url.port)?;
    conn.connect(&args.password)?;
    let result = dispatch(&mut conn, &url, &args.command);
    let _ = conn.disconnect();
    result
}

fn dispatch(conn: &mut Connection, url: &RemoteUrl, cmd: &Command) -> Result<()> {
    match cmd {
        Command::Scan { .. } => unreachable!("handled before dialing"),
        Command::Info => {
            let info = conn.info()?;
            println!("{} on port {}", info.name, info.port);
            println!(
                "auth: {}, {} sharing(s)",
                if info.auth { "required" } else { "open" },
                info.sharings.len()
            );
            Ok(())
        }
        Command::List => {
            for s in conn.list()? {
                let mode = if s.read_only { "ro" } else { "rw" };
                println!("{:4} {:2}  {}", s.ftype, mode, s.name);
            }
            Ok(())
        }
        _ => {
            let sharing = url
                .sharing
                .as_deref()
                .context("this command needs a sharing in the url")?;
            conn.open(sharing)?;
            if url.path != "/" {
                conn.rcd(&url.path)?;
            }
            in_sharing(conn, cmd)
        }
    }
}

fn in_sharing(conn: &mut Connection, cmd: &Command) -> Result<()> {
    match cmd {
        Command::Ls { path, all } => {
            for e in conn.rls(path.as_deref(), *all)? {
                let size = e.size.map(|s| s.to_string()).unwrap_or_default();
                println!("{:4} {:>12}  {}", e.ftype, size, e.name);
            }
        }
        Command::Tree { path, depth } => {
            for node in conn.rtree(path.as_deref(), *depth)? {
                let indent = "  ".repeat(node.depth.saturating_sub(1));
                let slash = if node.info.is_dir() { "/" } else { "" };
                println!("{}{}{}", indent, node.info.name, slash);
            }
        }
        Command::Find { name, path } => {
            for p in conn.rfind(name, path.as_deref())? {
                println!("{}", p);
            }
        }
        Command::Du { path } => {
            println!("{}", conn.rdu(path.as_deref())?);
        }
        Command::Mkdir { path } => conn.rmkdir(path)?,
        Command::Rm { paths } => {
            report_errors(conn.rrm(paths)?)?;
        }
        Command::Mv { paths } => {
            let (dest, sources) = paths.split_last().context("mv needs sources and a dest")?;
            report_errors(conn.rmv(sources, dest)?)?;
        }
        Command::Cp { paths } => {
            let (dest, sources) = paths.split_last().context("cp needs sources and a dest")?;
            report_errors(conn.rcp(sources, dest)?)?;
        }
        Command::Stat { paths } => {
            let (infos, errors) = conn.rstat(paths)?;
            for i in infos {
                println!(
                    "{:4} {:>12} {:>12}  {}",
                    i.ftype,
                    i.size.map(|s| s.to_string()).unwrap_or_default(),
                    i.mtime.map(|m| m.to_string()).unwrap_or_default(),
                    i.name
                );
            }
            report_errors(errors)?;
        }
        Command::Get {
            paths,
            out,
            check,
            no_hidden,
        } => {
            let bar = transfer_bar();
            let opts = GetOptions {
                check: *check,
                no_hidden: *no_hidden,
                max_entries: None,
            };
            let result = conn.get(paths, out, &opts, |info| {
                bar.set_message(info.name.clone());
                bar.tick();
            })?;
            bar.finish_and_clear();
            println!(
                "{} file(s), {} dir(s), {} bytes",
                result.files, result.dirs, result.bytes
            );
            for name in &result.check_failures {
                eprintln!("check failed: {}", name);
            }
            for e in &result.summary.errors {
                eprintln!("server: {}: {}", e.errno, e.subjects.join(", "));
            }
            if !result.summary.outcome || !result.check_failures.is_empty() {
                bail!("transfer finished with errors");
            }
        }
        Command::Put {
            sources,
            dest,
            check,
            overwrite,
            sync,
            preview,
        } => {
            let bar = transfer_bar();
            let opts = PutOptions {
                check: *check,
                preview: *preview,
                dest: dest.clone(),
                sync: *sync,
                policy: parse_policy(overwrite)?,
                conflict_fallback: OverwritePolicy::No,
            };
            let summary = conn.put(sources, &opts, |info| {
                bar.set_message(info.name.clone());
                bar.tick();
            })?;
            bar.finish_and_clear();
            for e in &summary.errors {
                eprintln!("server: {}: {}", e.errno, e.subjects.join(", "));
            }
            if let Some(results) = &summary.sync_results {
                let label = if *preview { "would remove" } else { "removed" };
                for r in results {
                    match &r.error {
                        None => println!("{}: {}", label, r.path),
                        Some(err) => eprintln!("sync rm {}: {}", r.path, err),
                    }
                }
            }
            if !summary.outcome {
                bail!("transfer finished with errors");
            }
        }
        Command::Scan { .. } | Command::Info | Command::List => unreachable!(),
    }
    Ok(())
}

fn scan(port: Option<u16>, timeout: u64) -> Result<()> {
    let port = port.unwrap_or_else(discovery::default_port);
    let found = discovery::discover(port, Duration::from_secs(timeout), |_| false)?;
    if found.is_empty() {
        println!("no servers found");
        return Ok(());
    }
    for d in found {
        let host = d
            .addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "skiff://{}:{}  {} ({} sharing(s))",
            host,
            d.port,
            d.name,
            d.sharings.len()
        );
    }
    Ok(())
}

fn parse_policy(s: &str) -> Result<OverwritePolicy> {
    Ok(match s {
        "prompt" => OverwritePolicy::Prompt,
        "yes" => OverwritePolicy::Yes,
        "no" => OverwritePolicy::No,
        "newerOnly" => OverwritePolicy::NewerOnly,
        "diffSizeOnly" => OverwritePolicy::DiffSizeOnly,
        "newerOrDiffSize" => OverwritePolicy::NewerOrDiffSize,
        other => bail!("unknown overwrite policy {:?}", other),
    })
}

fn transfer_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn report_errors(errors: Vec<ErrorDescriptor>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for e in &errors {
        eprintln!("{}: {}", e.errno, e.subjects.join(", "));
    }
    bail!("{} path(s) failed", errors.len())
}
