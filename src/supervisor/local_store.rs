//! Small key-value record that outlives the daemon, so a front end can still
//! find the app's URL after the launcher restarts.

use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// JSON file store for [`LocalRecord`].
pub struct LocalStore {
    file_path: PathBuf,
}

impl LocalStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Missing file reads as an empty record.
    pub fn load(&self) -> Result<LocalRecord> {
        if !self.file_path.exists() {
            return Ok(LocalRecord::default());
        }
        let content = fs::read_to_string(&self.file_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, record: &LocalRecord) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&self.file_path, content)?;
        tracing::debug!("Saved local record to {}", self.file_path.display());
        Ok(())
    }

    pub fn set_url(&self, url: &str) -> Result<()> {
        let mut record = self.load().unwrap_or_default();
        record.url = Some(url.to_string());
        self.save(&record)
    }

    pub fn clear_url(&self) -> Result<()> {
        if !self.file_path.exists() {
            return Ok(());
        }
        let mut record = self.load().unwrap_or_default();
        record.url = None;
        self.save(&record)
    }
}

/// Whether something accepts TCP connections at `endpoint`. Takes a URL
/// (`http://host:port/path`) or a bare `host:port`; a missing port falls back
/// to the scheme default.
pub fn endpoint_is_live(endpoint: &str, timeout: Duration) -> bool {
    let (scheme, rest) = endpoint.split_once("://").unwrap_or(("http", endpoint));
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return false;
    }
    let has_port = authority
        .rsplit_once(':')
        .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        authority.to_string()
    } else {
        let port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        format!("{}:{}", authority, port)
    };

    let Ok(addrs) = target.to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
