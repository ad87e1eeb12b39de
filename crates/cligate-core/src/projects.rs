use std::path::{Path, PathBuf};

use tokio::fs;

/// Working directories for CLI runs, one per project id, under a common root.
#[derive(Debug, Clone)]
pub struct ProjectWorkspace {
    root: PathBuf,
}

impl ProjectWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, project_id: &str) -> PathBuf {
        self.root.join(sanitize_project_id(project_id))
    }

    pub async fn ensure_directory(&self, project_id: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(project_id);
        fs::create_dir_all(&path).await?;
        Ok(path)
    }
}

/// Maps an arbitrary id to a single safe path component.
pub fn sanitize_project_id(project_id: &str) -> String {
    let cleaned = project_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned.to_string()
    }
}
