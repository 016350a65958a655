//! File-based job store: `{data_dir}/cron/jobs.json`.
//! Human-readable, rewritten on every mutating operation.

use std::path::{Path, PathBuf};

use switchyard_core::{Result, SwitchyardError};

use crate::job::CronJob;

/// File-based job store.
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    /// Create a store in `dir`, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("jobs.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save all jobs. Writes a temp file and renames it into place.
    pub fn save(&self, jobs: &[CronJob]) -> Result<()> {
        let json = serde_json::to_string_pretty(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| SwitchyardError::Storage(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SwitchyardError::Storage(format!("rename {}: {e}", self.path.display())))?;
        tracing::debug!("💾 Saved {} jobs to {}", jobs.len(), self.path.display());
        Ok(())
    }

    /// Load jobs. A missing file is an empty table.
    ///
    /// A file that does not parse is moved aside to `jobs.json.corrupt-{ts}`
    /// before starting empty, so the next save cannot overwrite it. Read
    /// errors fail the load.
    pub fn load(&self) -> Result<Vec<CronJob>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SwitchyardError::Storage(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        match serde_json::from_str(&json) {
            Ok(jobs) => Ok(jobs),
            Err(e) => {
                let aside = self.quarantine()?;
                tracing::error!(
                    "❌ Failed to parse {} ({e}); moved it to {} and starting with no jobs",
                    self.path.display(),
                    aside.display()
                );
                Ok(Vec::new())
            }
        }
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let aside = self.path.with_extension(format!("json.corrupt-{stamp}"));
        std::fs::rename(&self.path, &aside)
            .map_err(|e| SwitchyardError::Storage(format!("rename {}: {e}", self.path.display())))?;
        Ok(aside)
    }
}
