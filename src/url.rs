//! URL parsing for skiff:// server addresses.

use crate::proto::DEFAULT_PORT;

/// A parsed `skiff://host[:port][/sharing[/path]]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub host: String,
    pub port: u16,
    /// Sharing name, when the URL carries one.
    pub sharing: Option<String>,
    /// Path inside the sharing, always starting with `/`.
    pub path: String,
}

impl RemoteUrl {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_remote_url(input: &str) -> Option<RemoteUrl> {
    let s = input.trim();
    let lower = s.to_ascii_lowercase();
    let scheme_end = lower.find(':')?;
    if &lower[..=scheme_end] != "skiff:" {
        return None;
    }
    let mut rest = &s[scheme_end + 1..];
    if let Some(r) = rest.strip_prefix("//") {
        rest = r;
    }
    let (hp, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.split_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().unwrap_or(DEFAULT_PORT)),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    let (sharing, path) = if tail.is_empty() {
        (None, "/".to_string())
    } else {
        let (name, inner) = tail.split_once('/').unwrap_or((tail, ""));
        (Some(name.to_string()), format!("/{}", inner))
    };
    Some(RemoteUrl {
        host,
        port,
        sharing,
        path,
    })
}
