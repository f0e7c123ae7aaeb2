//! Study folder layout: trial definitions in, response rows out.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use therm_core::{IllusionKind, ResponseRow, TrialSet, TrialSetError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: TrialSetError,
    },
}

#[derive(Debug, Clone)]
pub struct StudyFolder {
    root: PathBuf,
}

impl StudyFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trial_set_path(&self, participant: u32) -> PathBuf {
        self.root
            .join("trial_info")
            .join(format!("p{participant}_trial_set.csv"))
    }

    pub fn response_path(&self, participant: u32) -> PathBuf {
        self.root
            .join("trial_responses")
            .join(format!("p{participant}_response.csv"))
    }

    pub fn load_trial_set(&self, kind: IllusionKind, participant: u32) -> Result<TrialSet, LoadError> {
        let path = self.trial_set_path(participant);
        let text = fs::read_to_string(&path).map_err(|source| LoadError::Read {
            path: path.clone(),
            source,
        })?;
        TrialSet::parse(kind, participant, &text).map_err(|source| LoadError::Parse { path, source })
    }

    /// Append one row, writing the header first when the file is new or empty.
    pub fn append_response_row(&self, row: &ResponseRow) -> std::io::Result<PathBuf> {
        let path = self.response_path(row.participant);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = String::new();
        if file.metadata()?.len() == 0 {
            out.push_str(&row.header());
            out.push('\n');
        }
        out.push_str(&row.to_csv_line());
        out.push('\n');
        file.write_all(out.as_bytes())?;
        debug!(path = %path.display(), trial = row.trial, "response row written");
        Ok(path)
    }
}
