// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway errors and their classification.
//!
//! Every failure is sorted into one of four classes. The class decides how
//! the connector lifecycle and the history orchestrator react:
//!
//! | Class | Reaction |
//! |-------|----------|
//! | [`ErrorClass::Transport`] | retried forever at the connector retry interval |
//! | [`ErrorClass::Delivery`] | batch stays queued, connector cycles reconnect |
//! | [`ErrorClass::Configuration`] | entity disabled, no retry |
//! | [`ErrorClass::Internal`] | logged, treated like a transport error by connectors |

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery rejected: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No {kind} driver registered for type \"{type_name}\"")]
    DriverNotFound {
        kind: &'static str,
        type_name: String,
    },

    #[error("Connector {connector} does not support {capability}")]
    CapabilityMismatch {
        connector: String,
        capability: String,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Connector {0} is disabled")]
    Disabled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classes driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Delivery,
    Configuration,
    Internal,
}

impl GatewayError {
    /// Shorthand for a configuration error carrying a message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        GatewayError::Config(crate::config::ConfigError::Invalid(msg.into()))
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Transport(_) => ErrorClass::Transport,
            GatewayError::Delivery(_) => ErrorClass::Delivery,
            GatewayError::Config(_)
            | GatewayError::DriverNotFound { .. }
            | GatewayError::CapabilityMismatch { .. }
            | GatewayError::Disabled(_) => ErrorClass::Configuration,
            GatewayError::Cache(_)
            | GatewayError::Io(_)
            | GatewayError::Sqlite(_)
            | GatewayError::Json(_) => ErrorClass::Internal,
        }
    }

    /// Configuration errors disable the entity instead of being retried.
    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Whether a connector should schedule a reconnect for this error.
    pub fn is_retryable(&self) -> bool {
        !self.is_configuration()
    }
}
