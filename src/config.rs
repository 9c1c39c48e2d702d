//! Store configuration and host hook slots.
//!
//! [`FolioConfig`] is handed to [`RecordStore::open`] and captures the
//! endpoint, pool sizing, socket timeouts, and the host platform's commit /
//! history callbacks. Defaults follow the platform conventions: three pooled
//! sessions, five-second connects, thirty-second receives, namespace 0 on
//! the local server.
//!
//! [`RecordStore::open`]: crate::store::RecordStore::open

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::types::{Dict, Diff, HisWriteResult};

/// Default namespace server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default pool size.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Endpoint
// =============================================================================

/// A parsed connection endpoint: `scheme://[:password@]host:port[/db]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical namespace index; defaults to 0.
    pub db: u32,
}

impl Endpoint {
    /// Parses a connection URI.
    ///
    /// Only path position 0 is consulted for the namespace index;
    /// non-numeric path components fall back to namespace 0.
    pub fn parse(uri: &str) -> Result<Endpoint> {
        let url = Url::parse(uri)
            .map_err(|e| Error::Commit(format!("invalid endpoint uri '{}': {}", uri, e)))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Commit(format!("endpoint uri '{}' has no host", uri)))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let password = url.password().map(|p| p.to_string());
        let db = url
            .path_segments()
            .and_then(|mut segs| segs.next())
            .and_then(|seg| seg.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(Endpoint {
            host,
            port,
            password,
            db,
        })
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Payload for the commit hooks: the diff, the pre-commit record (absent for
/// adds), and the caller-supplied context label.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub diff: Diff,
    pub old_rec: Option<Dict>,
    pub cx: Option<String>,
}

/// Payload for the post-history-write hook.
#[derive(Debug, Clone)]
pub struct HisWriteEvent {
    /// The host point record, including refreshed summary tags.
    pub rec: Dict,
    pub result: HisWriteResult,
    pub cx: Option<String>,
}

type PreCommitFn = dyn Fn(&CommitEvent) -> Result<()> + Send + Sync;
type PostCommitFn = dyn Fn(&CommitEvent) -> Result<()> + Send + Sync;
type PostHisWriteFn = dyn Fn(&HisWriteEvent) -> Result<()> + Send + Sync;

/// Host-supplied callback slots.
///
/// `pre_commit` runs per diff before storage is touched; an error aborts the
/// whole batch. `post_commit` and `post_his_write` run after the fact; their
/// errors are logged and swallowed. Commit hooks execute on the write-actor
/// thread and must not submit commits synchronously (that would deadlock the
/// actor's mailbox).
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_commit: Option<Arc<PreCommitFn>>,
    pub post_commit: Option<Arc<PostCommitFn>>,
    pub post_his_write: Option<Arc<PostHisWriteFn>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_commit", &self.pre_commit.is_some())
            .field("post_commit", &self.post_commit.is_some())
            .field("post_his_write", &self.post_his_write.is_some())
            .finish()
    }
}

// =============================================================================
// FolioConfig
// =============================================================================

/// Configuration accepted by [`RecordStore::open`].
///
/// [`RecordStore::open`]: crate::store::RecordStore::open
#[derive(Debug, Clone)]
pub struct FolioConfig {
    /// Diagnostic label, used in thread names and log output.
    pub name: String,
    /// Directory for auxiliary host files (password store); unused by the
    /// engine itself.
    pub dir: Option<PathBuf>,
    pub endpoint: Endpoint,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    /// When set, relative ref ids (no `:` qualifier) are absolutized by
    /// prefixing before interning.
    pub id_prefix: Option<String>,
    pub hooks: Hooks,
}

impl FolioConfig {
    pub fn new(name: impl Into<String>) -> Self {
        FolioConfig {
            name: name.into(),
            dir: None,
            endpoint: Endpoint::default(),
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            id_prefix: None,
            hooks: Hooks::default(),
        }
    }

    pub fn endpoint(mut self, uri: &str) -> Result<Self> {
        self.endpoint = Endpoint::parse(uri)?;
        Ok(self)
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn on_pre_commit(
        mut self,
        f: impl Fn(&CommitEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.pre_commit = Some(Arc::new(f));
        self
    }

    pub fn on_post_commit(
        mut self,
        f: impl Fn(&CommitEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.post_commit = Some(Arc::new(f));
        self
    }

    pub fn on_post_his_write(
        mut self,
        f: impl Fn(&HisWriteEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.post_his_write = Some(Arc::new(f));
        self
    }
}
