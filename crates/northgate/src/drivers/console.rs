// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `console` North: prints what it receives.

use crate::driver::{Connectable, NorthDriver};
use crate::error::{GatewayError, Result};
use crate::model::{ConnectorInfo, Content, ContentType};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsoleSettings {
    /// Print every value instead of a one-line summary.
    verbose: bool,
}

/// Writes deliveries to stdout.
pub struct ConsoleNorth {
    info: ConnectorInfo,
    settings: ConsoleSettings,
}

impl ConsoleNorth {
    pub fn new(info: ConnectorInfo, settings: &Value) -> Result<Self> {
        let settings = if settings.is_null() {
            ConsoleSettings::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| GatewayError::invalid(format!("{info}: {e}")))?
        };
        Ok(Self { info, settings })
    }
}

#[async_trait]
impl Connectable for ConsoleNorth {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NorthDriver for ConsoleNorth {
    fn supported_content_types(&self) -> Vec<ContentType> {
        vec![ContentType::TimeValues, ContentType::Any]
    }

    async fn handle_content(&self, content: &Content) -> Result<()> {
        match content {
            Content::TimeValues(values) if self.settings.verbose => {
                for value in values {
                    println!(
                        "[{}] {} {} {}",
                        self.info.id, value.timestamp, value.point_id, value.data
                    );
                }
            }
            Content::TimeValues(values) => {
                println!("[{}] {} value(s)", self.info.id, values.len());
            }
            Content::File(file) => {
                println!(
                    "[{}] file {} ({} bytes)",
                    self.info.id, file.original_name, file.size
                );
            }
        }
        Ok(())
    }
}
