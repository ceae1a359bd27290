//! Directory-backed plan store.
//!
//! Layout under the root directory:
//!
//! ```text
//! plans/<plan_id>.json | plans/<plan_id>.toml   plan definitions
//! runs/<plan_id>.status.json                    latest run status
//! runs/<plan_id>.steps.jsonl                    one line per completed step
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{PlanStore, StoreError};
use crate::plan::ExecutionPlan;
use crate::run::RunStatus;

/// One line of a `.steps.jsonl` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletionRecord {
    pub step_id: String,
    pub completed_at: chrono::DateTime<Utc>,
}

/// Plan store backed by a directory of JSON/TOML files.
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    root: PathBuf,
}

impl FilePlanStore {
    /// Open a store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// Write a plan definition as JSON.
    pub async fn save_plan(&self, plan: &ExecutionPlan) -> Result<(), StoreError> {
        check_id(&plan.plan_id)?;
        let dir = self.plans_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(plan)?;
        tokio::fs::write(dir.join(format!("{}.json", plan.plan_id)), json).await?;
        Ok(())
    }

    /// Read back the latest status written for a plan.
    pub async fn load_run_status(&self, plan_id: &str) -> Result<Option<RunStatus>, StoreError> {
        check_id(plan_id)?;
        let path = self.runs_dir().join(format!("{}.status.json", plan_id));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read back the step completions recorded for a plan.
    pub async fn load_step_completions(
        &self,
        plan_id: &str,
    ) -> Result<Vec<StepCompletionRecord>, StoreError> {
        check_id(plan_id)?;
        let path = self.runs_dir().join(format!("{}.steps.jsonl", plan_id));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}

/// Plan ids become file names; refuse anything that could escape the root.
fn check_id(plan_id: &str) -> Result<(), StoreError> {
    if plan_id.is_empty()
        || plan_id.contains(['/', '\\'])
        || plan_id == "."
        || plan_id == ".."
    {
        return Err(StoreError::NotFound(plan_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn load_plan(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError> {
        check_id(plan_id)?;
        let dir = self.plans_dir();

        let json_path = dir.join(format!("{}.json", plan_id));
        if tokio::fs::try_exists(&json_path).await? {
            debug!(path = %json_path.display(), "Loading plan");
            let content = tokio::fs::read_to_string(&json_path).await?;
            return ExecutionPlan::from_json(&content)
                .map_err(|e| StoreError::Serialization(e.to_string()));
        }

        let toml_path = dir.join(format!("{}.toml", plan_id));
        if tokio::fs::try_exists(&toml_path).await? {
            debug!(path = %toml_path.display(), "Loading plan");
            let content = tokio::fs::read_to_string(&toml_path).await?;
            return ExecutionPlan::from_toml(&content)
                .map_err(|e| StoreError::Serialization(e.to_string()));
        }

        Err(StoreError::NotFound(plan_id.to_string()))
    }

    async fn save_run_status(&self, plan_id: &str, status: &RunStatus) -> Result<(), StoreError> {
        check_id(plan_id)?;
        let dir = self.runs_dir();
        tokio::fs::create_dir_all(&dir).await?;

        // Write-then-rename so readers never see a torn file
        let path = dir.join(format!("{}.status.json", plan_id));
        let tmp = dir.join(format!("{}.status.json.tmp", plan_id));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(status)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn save_step_completion(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        check_id(plan_id)?;
        let dir = self.runs_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let record = StepCompletionRecord {
            step_id: step_id.to_string(),
            completed_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.steps.jsonl", plan_id)))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
