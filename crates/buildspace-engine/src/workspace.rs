//! Ephemeral repository workspaces.
//!
//! Every tool invocation that needs repository content clones a fresh copy
//! into its own directory. The returned [`Workspace`] owns that directory and
//! deletes it when dropped, on success and failure paths alike.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Files larger than this are reported as too large instead of being read.
pub const MAX_FILE_BYTES: u64 = 100_000;
pub const DEFAULT_MAX_TREE_ENTRIES: usize = 5000;
const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(120);

pub const TOO_LARGE_MESSAGE: &str = "File too large to analyze";
pub const TRUNCATION_WARNING: &str = "Too many files - stopped early";

/// Dependency caches skipped by the tree walk (hidden entries are always skipped).
const SKIP_DIRS: &[&str] = &["node_modules", "bower_components", "__pycache__"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("invalid repository URL: {0:?}")]
    InvalidUrl(String),

    #[error("failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    #[error("clone of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("clone of {0} cancelled")]
    Cancelled(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct AcquirerConfig {
    /// Parent directory for all workspaces.
    pub root: PathBuf,
    pub clone_timeout: Duration,
    pub max_tree_entries: usize,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir(),
            clone_timeout: DEFAULT_CLONE_TIMEOUT,
            max_tree_entries: DEFAULT_MAX_TREE_ENTRIES,
        }
    }
}

/// Clones repositories into uniquely named scratch directories.
pub struct WorkspaceAcquirer {
    config: AcquirerConfig,
    counter: AtomicU64,
}

impl WorkspaceAcquirer {
    pub fn new(config: AcquirerConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AcquirerConfig {
        &self.config
    }

    /// `<root>/repo-<unix_ms>-<n>-<name>`: readable in `ls`, unique per call.
    pub fn workspace_path(&self, url: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let dir = format!(
            "repo-{}-{}-{}",
            Utc::now().timestamp_millis(),
            n,
            repository_name(url)
        );
        self.config.root.join(dir)
    }

    /// Clone `url` (default branch, full history) into a fresh workspace.
    #[instrument(skip(self, cancel), fields(repo_url = %url))]
    pub async fn acquire(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Workspace, WorkspaceError> {
        let url = normalize_url(url)?;
        let path = self.workspace_path(&url);

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(path = %path.display(), "Removing stale workspace");
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&self.config.root).await?;

        // Own the path before git touches it so every failure below cleans up.
        let workspace = Workspace {
            path,
            url: url.clone(),
            created_at: Utc::now(),
        };

        let mut command = tokio::process::Command::new("git");
        command
            .arg("clone")
            .arg("--quiet")
            .arg("--")
            .arg(&url)
            .arg(&workspace.path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = self.config.clone_timeout;
        let output = tokio::select! {
            res = tokio::time::timeout(timeout, command.output()) => match res {
                Ok(output) => output.map_err(|e| WorkspaceError::Clone {
                    url: url.clone(),
                    message: format!("failed to run git: {e}"),
                })?,
                Err(_) => return Err(WorkspaceError::Timeout { url, timeout }),
            },
            _ = cancel.cancelled() => return Err(WorkspaceError::Cancelled(url)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("git exited with {}", output.status)
            } else {
                stderr
            };
            return Err(WorkspaceError::Clone { url, message });
        }

        tracing::info!(path = %workspace.path.display(), "Repository cloned");
        Ok(workspace)
    }
}

/// A cloned working tree owned by a single tool invocation.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    url: String,
    created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn list_tree(&self, max_entries: usize) -> Result<DirectoryTree, WorkspaceError> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || list_tree(&root, max_entries))
            .await
            .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))?
    }

    pub async fn read_file(&self, relative: &str) -> Result<FileContent, WorkspaceError> {
        read_file(&self.path, relative).await
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        let remove = move || match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeNode {
    File,
    Dir(BTreeMap<String, TreeNode>),
}

/// Result of a bounded directory walk. When `truncated` is set the walk
/// stopped early; everything in `entries` was still collected consistently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryTree {
    pub entries: BTreeMap<String, TreeNode>,
    pub truncated: bool,
}

impl DirectoryTree {
    /// Total number of nodes at every depth.
    pub fn entry_count(&self) -> usize {
        fn count(map: &BTreeMap<String, TreeNode>) -> usize {
            map.values()
                .map(|node| match node {
                    TreeNode::File => 1,
                    TreeNode::Dir(children) => 1 + count(children),
                })
                .sum()
        }
        count(&self.entries)
    }

    /// Nested JSON: directories are objects, files are the string `"file"`.
    pub fn to_json(&self) -> Value {
        fn render(map: &BTreeMap<String, TreeNode>) -> Value {
            Value::Object(
                map.iter()
                    .map(|(name, node)| {
                        let value = match node {
                            TreeNode::File => Value::String("file".into()),
                            TreeNode::Dir(children) => render(children),
                        };
                        (name.clone(), value)
                    })
                    .collect(),
            )
        }

        let mut json = render(&self.entries);
        if self.truncated {
            if let Value::Object(map) = &mut json {
                map.insert("warning".into(), Value::String(TRUNCATION_WARNING.into()));
            }
        }
        json
    }
}

/// Depth-first walk of `root`, sorted by name, skipping hidden entries and
/// dependency caches. Stops once more than `max_entries` nodes were visited.
pub fn list_tree(root: &Path, max_entries: usize) -> Result<DirectoryTree, WorkspaceError> {
    let mut visited = 0;
    let mut truncated = false;
    let entries = walk(root, max_entries, &mut visited, &mut truncated)?;
    Ok(DirectoryTree { entries, truncated })
}

fn walk(
    dir: &Path,
    max_entries: usize,
    visited: &mut usize,
    truncated: &mut bool,
) -> std::io::Result<BTreeMap<String, TreeNode>> {
    let mut children: Vec<(String, bool)> = std::fs::read_dir(dir)?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            // file_type() does not follow symlinks, so linked dirs are leaves.
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if name.starts_with('.') || (is_dir && SKIP_DIRS.contains(&name.as_str())) {
                None
            } else {
                Some((name, is_dir))
            }
        })
        .collect();
    children.sort();

    let mut map = BTreeMap::new();
    for (name, is_dir) in children {
        if *truncated {
            break;
        }
        *visited += 1;
        if *visited > max_entries {
            *truncated = true;
            break;
        }

        let node = if is_dir {
            // Unreadable subdirectories show up empty rather than failing the walk.
            TreeNode::Dir(walk(&dir.join(&name), max_entries, visited, truncated).unwrap_or_default())
        } else {
            TreeNode::File
        };
        map.insert(name, node);
    }
    Ok(map)
}

/// Content of a file read from a workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    /// Size limit hit; the file was not read.
    TooLarge { size: u64 },
}

impl FileContent {
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::TooLarge { .. } => TOO_LARGE_MESSAGE.to_string(),
        }
    }
}

/// Read `relative` inside `root`. Paths that are absolute, climb out with
/// `..`, or resolve through a symlink to somewhere outside `root` are refused.
pub async fn read_file(root: &Path, relative: &str) -> Result<FileContent, WorkspaceError> {
    let joined = resolve_within(root, relative)?;

    let canonical = match tokio::fs::canonicalize(&joined).await {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkspaceError::NotFound(relative.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let canonical_root = tokio::fs::canonicalize(root).await?;
    if !canonical.starts_with(&canonical_root) {
        return Err(WorkspaceError::InvalidPath(relative.to_string()));
    }

    let metadata = tokio::fs::metadata(&canonical).await?;
    if !metadata.is_file() {
        return Err(WorkspaceError::NotAFile(relative.to_string()));
    }
    if metadata.len() > MAX_FILE_BYTES {
        return Ok(FileContent::TooLarge {
            size: metadata.len(),
        });
    }

    let bytes = tokio::fs::read(&canonical).await?;
    Ok(FileContent::Text(String::from_utf8_lossy(&bytes).into_owned()))
}

fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, WorkspaceError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::InvalidPath(relative.to_string()));
    }
    let path = Path::new(trimmed);
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(WorkspaceError::InvalidPath(relative.to_string()));
    }
    Ok(root.join(path))
}

fn normalize_url(url: &str) -> Result<String, WorkspaceError> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() || url.starts_with('-') {
        return Err(WorkspaceError::InvalidUrl(url.to_string()));
    }
    Ok(url.to_string())
}

/// Last path segment without `.git`, reduced to filesystem-safe characters.
fn repository_name(url: &str) -> String {
    let last = url.trim_end_matches('/').rsplit(['/', ':']).next().unwrap_or("");
    let last = last.strip_suffix(".git").unwrap_or(last);
    let name: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let name = name.trim_matches(|c| c == '.' || c == '-');
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}
