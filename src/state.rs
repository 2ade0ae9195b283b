use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::{Result, TriageError};

/// Persistent "last successful new-mail pass" timestamp
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Missing or unreadable state yields the current time
    async fn read(&self) -> DateTime<Utc>;

    async fn write(&self, timestamp: DateTime<Utc>) -> Result<()>;
}

/// Watermark kept as an RFC 3339 line in a text file
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read(&self) -> DateTime<Utc> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::info!(
                    "No watermark at {:?} ({}), starting from now",
                    self.path,
                    e.kind()
                );
                return Utc::now();
            }
        };

        match parse_timestamp(&content) {
            Ok(timestamp) => {
                tracing::debug!("Loaded watermark {} from {:?}", timestamp, self.path);
                timestamp
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable watermark in {:?}: {}", self.path, e);
                Utc::now()
            }
        }
    }

    async fn write(&self, timestamp: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&self.path, timestamp.to_rfc3339()).await?;
        tracing::debug!("Saved watermark {} to {:?}", timestamp, self.path);
        Ok(())
    }
}

/// Parse an RFC 3339 timestamp such as `2024-03-04T10:30:00.000Z`
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TriageError::State(format!("Invalid timestamp '{}': {}", value.trim(), e)))
}
