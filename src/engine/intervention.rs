//! Intervention records and the append-only audit log.
//!
//! Interventions are recorded for audit; nothing else depends on them.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ForemanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionKind {
    Amplify,
    Redirect,
    Mediate,
    Inject,
    Prune,
}

impl InterventionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amplify => "AMPLIFY",
            Self::Redirect => "REDIRECT",
            Self::Mediate => "MEDIATE",
            Self::Inject => "INJECT",
            Self::Prune => "PRUNE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: String,
    pub kind: InterventionKind,
    pub targets: Vec<String>,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl Intervention {
    pub fn new(kind: InterventionKind, targets: Vec<String>, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            targets,
            rationale: rationale.into(),
            created_at: Utc::now(),
        }
    }
}

/// Operator-facing escalation. Never auto-resolved by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub worker: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worker: worker.into(),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    Intervention(Intervention),
    Escalation(Escalation),
    Dispatch {
        worker: String,
        task_id: String,
        at: DateTime<Utc>,
    },
}

/// Append-only JSONL audit trail, one record per line. Human-inspectable
/// with standard tooling; `replay` reads it back for tests and the
/// dashboard collaborator.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.file.lock();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ForemanError::Audit(format!("open failed: {}", e)))?;
        writeln!(file, "{}", line).map_err(|e| ForemanError::Audit(format!("write failed: {}", e)))?;
        file.sync_data()
            .map_err(|e| ForemanError::Audit(format!("sync failed: {}", e)))?;
        Ok(())
    }

    pub fn replay(&self) -> Result<Vec<AuditRecord>> {
        let _guard = self.file.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)
            .map_err(|e| ForemanError::Audit(format!("open failed: {}", e)))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| ForemanError::Audit(format!("read failed: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
