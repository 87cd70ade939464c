// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `folder` North: writes deliveries into a local folder.
//!
//! Value batches become `values-<millis>-<n>.json`, files are copied under
//! their original name prefixed with the delivery time.

use crate::driver::{Connectable, NorthDriver};
use crate::error::{GatewayError, Result};
use crate::model::{ConnectorInfo, Content, ContentType};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Deserialize)]
struct FolderSettings {
    output_folder: PathBuf,
}

/// Copies deliveries into `output_folder`.
pub struct FolderNorth {
    info: ConnectorInfo,
    output: PathBuf,
    written: AtomicU64,
}

impl FolderNorth {
    pub fn new(info: ConnectorInfo, settings: &Value) -> Result<Self> {
        let settings: FolderSettings = serde_json::from_value(settings.clone())
            .map_err(|e| GatewayError::invalid(format!("{info}: {e}")))?;
        Ok(Self {
            info,
            output: settings.output_folder,
            written: AtomicU64::new(0),
        })
    }

    fn unreachable(&self, err: std::io::Error) -> GatewayError {
        GatewayError::Transport(format!(
            "{}: {}: {}",
            self.info,
            self.output.display(),
            err
        ))
    }
}

#[async_trait]
impl Connectable for FolderNorth {
    async fn connect(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.output)
            .await
            .map_err(|e| self.unreachable(e))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NorthDriver for FolderNorth {
    fn supported_content_types(&self) -> Vec<ContentType> {
        vec![ContentType::TimeValues, ContentType::Any]
    }

    async fn handle_content(&self, content: &Content) -> Result<()> {
        let stamp = Utc::now().timestamp_millis();
        let n = self.written.fetch_add(1, Ordering::Relaxed);
        match content {
            Content::TimeValues(values) => {
                let json = serde_json::to_vec_pretty(values)?;
                let target = self.output.join(format!("values-{stamp}-{n}.json"));
                tokio::fs::write(&target, json)
                    .await
                    .map_err(|e| self.unreachable(e))
            }
            Content::File(file) => {
                let target = self.output.join(format!("{stamp}-{n}-{}", file.original_name));
                tokio::fs::copy(&file.path, &target)
                    .await
                    .map(|_| ())
                    .map_err(|e| self.unreachable(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectorKind, FileRef, TimeValue};

    fn info() -> ConnectorInfo {
        ConnectorInfo {
            id: "out".into(),
            name: "Output".into(),
            type_name: "folder".into(),
            kind: ConnectorKind::North,
        }
    }

    #[test]
    fn test_missing_output_folder_is_configuration_error() {
        let err = FolderNorth::new(info(), &serde_json::json!({})).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_writes_values_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        let north = FolderNorth::new(
            info(),
            &serde_json::json!({ "output_folder": output.to_string_lossy() }),
        )
        .unwrap();
        north.connect().await.unwrap();

        north
            .handle_content(&Content::TimeValues(vec![TimeValue::new(
                "p",
                Utc::now(),
                serde_json::json!(1.5),
            )]))
            .await
            .unwrap();

        let src = dir.path().join("report.csv");
        std::fs::write(&src, b"a").unwrap();
        north
            .handle_content(&Content::File(FileRef {
                path: src,
                original_name: "report.csv".into(),
                size: 1,
                created_at: Utc::now(),
            }))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(&output)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.starts_with("values-")));
        assert!(names.iter().any(|n| n.ends_with("-report.csv")));
    }

    #[tokio::test]
    async fn test_connection_to_unusable_folder_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-folder");
        std::fs::write(&blocker, b"x").unwrap();

        let north = FolderNorth::new(
            info(),
            &serde_json::json!({ "output_folder": blocker.to_string_lossy() }),
        )
        .unwrap();
        let err = north.test_connection().await.unwrap_err();
        assert!(err.is_retryable());

        let north = FolderNorth::new(
            info(),
            &serde_json::json!({ "output_folder": dir.path().join("ok").to_string_lossy() }),
        )
        .unwrap();
        north.test_connection().await.unwrap();
    }
}
