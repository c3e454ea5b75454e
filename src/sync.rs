//! Source synchronization into the component pod
//!
//! The push flow only needs to know whether anything changed, so syncing is
//! behind the [`Syncer`] trait. [`IndexedSyncer`] keeps a SHA-256 index of the
//! project under `.devpush/file-index.json` and copies changed files through
//! exec.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::cluster::{CommandRunner, ExecRequest};
use crate::config::STATE_DIR;
use crate::error::{Error, Result};

const INDEX_FILE: &str = "file-index.json";

/// Where to sync and what the cluster side looks like
#[derive(Clone, Debug, Default)]
pub struct SyncParameters {
    pub pod: String,
    pub container: String,
    pub sync_folder: String,
    pub project_dir: PathBuf,
    pub component_exists: bool,
    /// The pod was replaced, so its project volume starts empty
    pub pod_changed: bool,
    pub force_build: bool,
}

impl SyncParameters {
    /// Everything has to be copied: new component, new pod or forced build
    pub fn full_sync(&self) -> bool {
        !self.component_exists || self.pod_changed || self.force_build
    }
}

#[async_trait]
pub trait Syncer: Send + Sync {
    /// Sync the project into the target container. Returns whether the devfile
    /// commands have to be executed again.
    async fn sync_files(&self, runner: &dyn CommandRunner, params: &SyncParameters)
        -> Result<bool>;
}

/// Relative path to hex SHA-256 of the file content
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub files: BTreeMap<String, String>,
}

impl FileIndex {
    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join(INDEX_FILE)
    }

    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = Self::path(project_dir);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Hash every file under `root`, skipping the `ignore` names
    pub fn scan(root: &Path, ignore: &[String]) -> Result<Self> {
        let mut files = BTreeMap::new();
        scan_dir(root, root, ignore, &mut files)?;
        Ok(Self { files })
    }
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    ignore: &[String],
    files: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if ignore.iter().any(|i| *i == name) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            scan_dir(root, &path, ignore, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))?;
            let content = std::fs::read(&path)?;
            files.insert(
                relative.to_string_lossy().replace('\\', "/"),
                compute_sha256(&content),
            );
        }
    }
    Ok(())
}

fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Files to copy and files to remove on the remote side
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

impl SyncPlan {
    pub fn between(previous: &FileIndex, current: &FileIndex, full: bool) -> Self {
        let changed = current
            .files
            .iter()
            .filter(|(path, hash)| full || previous.files.get(*path) != Some(*hash))
            .map(|(path, _)| path.clone())
            .collect();
        let deleted = if full {
            Vec::new()
        } else {
            previous
                .files
                .keys()
                .filter(|path| !current.files.contains_key(*path))
                .cloned()
                .collect()
        };
        Self { changed, deleted }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Quote for a POSIX shell single-quoted string
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn remote_path(folder: &str, relative: &str) -> String {
    format!("{}/{}", folder.trim_end_matches('/'), relative)
}

pub struct IndexedSyncer {
    ignore: Vec<String>,
}

impl Default for IndexedSyncer {
    fn default() -> Self {
        Self {
            ignore: vec![STATE_DIR.to_string(), ".git".to_string()],
        }
    }
}

impl IndexedSyncer {
    pub fn with_ignore(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignore.extend(names);
        self
    }

    async fn push_file(
        &self,
        runner: &dyn CommandRunner,
        params: &SyncParameters,
        relative: &str,
    ) -> Result<()> {
        let content = std::fs::read(params.project_dir.join(relative))?;
        let target = shell_quote(&remote_path(&params.sync_folder, relative));
        let output = runner
            .exec(ExecRequest {
                pod: params.pod.clone(),
                container: params.container.clone(),
                command: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("mkdir -p \"$(dirname {target})\" && cat > {target}"),
                ],
                stdin: Some(content),
                ..Default::default()
            })
            .await?;
        if !output.success {
            return Err(Error::CommandExecution {
                id: "sync".to_string(),
                message: format!("unable to copy {relative}: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }

    async fn remove_files(
        &self,
        runner: &dyn CommandRunner,
        params: &SyncParameters,
        deleted: &[String],
    ) -> Result<()> {
        let mut command = vec!["rm".to_string(), "-rf".to_string()];
        command.extend(deleted.iter().map(|d| remote_path(&params.sync_folder, d)));
        let output = runner
            .exec(ExecRequest {
                pod: params.pod.clone(),
                container: params.container.clone(),
                command,
                ..Default::default()
            })
            .await?;
        if !output.success {
            return Err(Error::CommandExecution {
                id: "sync".to_string(),
                message: format!("unable to remove deleted files: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Syncer for IndexedSyncer {
    #[instrument(skip(self, runner, params), fields(pod = %params.pod, container = %params.container))]
    async fn sync_files(
        &self,
        runner: &dyn CommandRunner,
        params: &SyncParameters,
    ) -> Result<bool> {
        let full = params.full_sync();
        let previous = if full {
            FileIndex::default()
        } else {
            FileIndex::load(&params.project_dir)?
        };
        let current = FileIndex::scan(&params.project_dir, &self.ignore)?;
        let plan = SyncPlan::between(&previous, &current, full);

        if !full && plan.is_empty() {
            debug!("no file changes since the last push");
            return Ok(false);
        }

        if !plan.deleted.is_empty() {
            info!("Removing {} deleted file(s) from the component", plan.deleted.len());
            self.remove_files(runner, params, &plan.deleted).await?;
        }
        info!(
            "Syncing {} file(s) to {}:{}",
            plan.changed.len(),
            params.container,
            params.sync_folder
        );
        for relative in &plan.changed {
            self.push_file(runner, params, relative).await?;
        }

        current.save(&params.project_dir)?;
        Ok(true)
    }
}
