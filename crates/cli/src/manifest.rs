//! JSON manifest describing one stored file.

use anyhow::{Context, Result, bail};
use relaydrive_core::Node;
use relaydrive_storage::ChunkUpload;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub size: u64,
    pub nodes: Vec<Node>,
}

impl Manifest {
    /// Assemble a manifest from writer output, in whatever order it arrived.
    pub fn from_uploads(name: impl Into<String>, mut uploads: Vec<ChunkUpload>) -> Result<Self> {
        uploads.sort_by_key(|upload| upload.sequence);
        for (expected, upload) in uploads.iter().enumerate() {
            if upload.sequence != expected as u64 {
                bail!("chunk {expected} is missing from the upload");
            }
        }

        let nodes: Vec<Node> = uploads.into_iter().map(|upload| upload.node).collect();
        let size = nodes.iter().map(Node::size).sum();
        Ok(Self {
            name: name.into(),
            size,
            nodes,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;

        let total: u64 = manifest.nodes.iter().map(Node::size).sum();
        if total != manifest.size {
            bail!(
                "manifest {} declares {} bytes but its chunks hold {total}",
                path.display(),
                manifest.size
            );
        }
        Ok(manifest)
    }

    /// Write the manifest, replacing any previous version atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("failed to serialize manifest")?;
        let tmp = temp_path(path);
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write manifest {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace manifest {}", path.display()))?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
