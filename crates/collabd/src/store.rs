//! Document and file storage collaborators.
//!
//! The daemon reads notebooks to find their owning workspace and writes
//! cell sources and execution outputs back. Uploaded workspace files go to
//! a separate [`FileStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{CollabError, CollabResult};
use crate::protocol::Output;

fn default_cell_type() -> String {
    "code".to_string()
}

/// A notebook cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    #[serde(default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub execution_count: Option<u32>,
}

impl Cell {
    pub fn code(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cell_type: default_cell_type(),
            source: source.into(),
            outputs: Vec::new(),
            execution_count: None,
        }
    }
}

/// A notebook document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cells: Vec<Cell>,
}

impl Notebook {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: String::new(),
            cells: Vec::new(),
        }
    }

    pub fn with_cell(mut self, cell: Cell) -> Self {
        self.cells.push(cell);
        self
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    fn cell_mut(&mut self, cell_id: &str) -> CollabResult<&mut Cell> {
        self.cells
            .iter_mut()
            .find(|c| c.id == cell_id)
            .ok_or_else(|| CollabError::cell_not_found(cell_id))
    }
}

/// A change applied to one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellPatch {
    Source(String),
    Execution {
        outputs: Vec<Output>,
        execution_count: Option<u32>,
    },
}

impl CellPatch {
    fn apply(self, cell: &mut Cell) {
        match self {
            CellPatch::Source(source) => cell.source = source,
            CellPatch::Execution {
                outputs,
                execution_count,
            } => {
                cell.outputs = outputs;
                if execution_count.is_some() {
                    cell.execution_count = execution_count;
                }
            }
        }
    }
}

/// Persistent notebook storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_notebook(&self, notebook_id: &str) -> CollabResult<Notebook>;

    /// Persist a whole notebook. Returns where it was written.
    async fn save_notebook(&self, notebook: &Notebook) -> CollabResult<PathBuf>;

    /// Read-modify-write one cell without losing concurrent patches to
    /// other cells of the same notebook.
    async fn update_cell(
        &self,
        notebook_id: &str,
        cell_id: &str,
        patch: CellPatch,
    ) -> CollabResult<PathBuf>;
}

/// Notebooks held in memory.
#[derive(Default)]
pub struct MemoryStore {
    notebooks: StdMutex<HashMap<String, Notebook>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, notebook: Notebook) {
        self.notebooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(notebook.id.clone(), notebook);
    }

    fn location(notebook_id: &str) -> PathBuf {
        PathBuf::from("memory").join(notebook_doc_filename(notebook_id))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_notebook(&self, notebook_id: &str) -> CollabResult<Notebook> {
        self.notebooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_id)
            .cloned()
            .ok_or_else(|| CollabError::notebook_not_found(notebook_id))
    }

    async fn save_notebook(&self, notebook: &Notebook) -> CollabResult<PathBuf> {
        self.insert(notebook.clone());
        Ok(Self::location(&notebook.id))
    }

    async fn update_cell(
        &self,
        notebook_id: &str,
        cell_id: &str,
        patch: CellPatch,
    ) -> CollabResult<PathBuf> {
        let mut notebooks = self.notebooks.lock().unwrap_or_else(PoisonError::into_inner);
        let notebook = notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| CollabError::notebook_not_found(notebook_id))?;
        patch.apply(notebook.cell_mut(cell_id)?);
        Ok(Self::location(notebook_id))
    }
}

/// Filename for a persisted notebook: SHA-256 of the id, so arbitrary ids
/// map to safe, fixed-length names.
pub fn notebook_doc_filename(notebook_id: &str) -> String {
    let hash = hex::encode(Sha256::digest(notebook_id.as_bytes()));
    format!("{}.json", hash)
}

/// One JSON file per notebook under a directory.
pub struct FsStore {
    docs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStore {
    pub fn new(docs_dir: impl Into<PathBuf>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, notebook_id: &str) -> PathBuf {
        self.docs_dir.join(notebook_doc_filename(notebook_id))
    }

    async fn read(&self, notebook_id: &str) -> CollabResult<Notebook> {
        let path = self.path_for(notebook_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollabError::notebook_not_found(notebook_id));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| CollabError::Store(format!("corrupt notebook {:?}: {}", path, e)))
    }

    async fn write(&self, notebook: &Notebook) -> CollabResult<PathBuf> {
        let path = self.path_for(&notebook.id);
        persist_bytes(&serde_json::to_vec_pretty(notebook)?, &path).await?;
        debug!("[store] Saved notebook {} to {:?}", notebook.id, path);
        Ok(path)
    }
}

/// Write through a temp file and rename, so readers never see a torn file.
async fn persist_bytes(data: &[u8], path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn get_notebook(&self, notebook_id: &str) -> CollabResult<Notebook> {
        self.read(notebook_id).await
    }

    async fn save_notebook(&self, notebook: &Notebook) -> CollabResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        self.write(notebook).await
    }

    async fn update_cell(
        &self,
        notebook_id: &str,
        cell_id: &str,
        patch: CellPatch,
    ) -> CollabResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        let mut notebook = self.read(notebook_id).await?;
        patch.apply(notebook.cell_mut(cell_id)?);
        self.write(&notebook).await
    }
}

/// Metadata for an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub workspace_id: String,
    pub filename: String,
    pub description: String,
    pub size: u64,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Storage for files shared into a workspace.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(
        &self,
        workspace_id: &str,
        user_id: &str,
        filename: &str,
        description: &str,
        data: Bytes,
    ) -> CollabResult<FileInfo>;
}

/// Files on local disk, one directory per workspace.
pub struct FsFileStore {
    root: PathBuf,
    max_bytes: usize,
}

impl FsFileStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.root
            .join(hex::encode(Sha256::digest(workspace_id.as_bytes())))
    }
}

fn validate_filename(filename: &str) -> CollabResult<()> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CollabError::Store(format!("Invalid filename: {:?}", filename)));
    }
    Ok(())
}

#[async_trait]
impl FileStore for FsFileStore {
    async fn upload(
        &self,
        workspace_id: &str,
        user_id: &str,
        filename: &str,
        description: &str,
        data: Bytes,
    ) -> CollabResult<FileInfo> {
        validate_filename(filename)?;
        if data.len() > self.max_bytes {
            return Err(CollabError::Store(format!(
                "File exceeds maximum upload size of {} bytes",
                self.max_bytes
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let path = self
            .workspace_dir(workspace_id)
            .join(format!("{}-{}", id, filename));
        persist_bytes(&data, &path).await?;
        info!(
            "[store] Stored {} ({} bytes) for workspace {}",
            filename,
            data.len(),
            workspace_id
        );

        Ok(FileInfo {
            id,
            workspace_id: workspace_id.to_string(),
            filename: filename.to_string(),
            description: description.to_string(),
            size: data.len() as u64,
            uploaded_by: user_id.to_string(),
            uploaded_at: Utc::now(),
        })
    }
}
