// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error markers that indicate a transient infrastructure failure. A task
/// whose error message carries one of these is eligible for retry.
pub const RETRYABLE_MARKERS: [&str; 8] = [
    "ETIMEOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "NETWORK_ERROR",
    "RESOURCE_BUSY",
    "CONFLICT",
];

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Dependency error: {message}")]
    Dependency { message: String, retryable: bool },
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Scheduler error: {0}")]
    Scheduler(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Worth retrying once the backoff elapses.
    Retryable,
    /// Deadline or congestion effects, retryable under the task policy.
    Transient,
    /// No retry will change the outcome.
    Fatal,
}

impl RuntimeError {
    /// Stable error identifier surfaced in execution results and events.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeError::Validation(_) => "ValidationError",
            RuntimeError::NotFound(_) => "NotFoundError",
            RuntimeError::Dependency { .. } => "DependencyError",
            RuntimeError::Execution(_) => "ExecutionError",
            RuntimeError::Timeout(_) => "TimeoutError",
            RuntimeError::CyclicDependency(_) => "CyclicDependencyError",
            RuntimeError::Config(_) => "ConfigError",
            RuntimeError::Scheduler(_) => "SchedulerError",
            RuntimeError::Internal(_) => "InternalError",
        }
    }

    /// Maps the error to a retry class; anything unrecognised falls
    /// through to fatal.
    pub fn classify(&self) -> ErrorClass {
        match self {
            RuntimeError::Timeout(_) => ErrorClass::Transient,
            RuntimeError::Dependency { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            RuntimeError::Execution(message) | RuntimeError::Scheduler(message) => {
                if message_is_retryable(message) {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.classify(), ErrorClass::Fatal)
    }

    /// Process exit code when the runtime is embedded in a CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Validation(_) | RuntimeError::CyclicDependency(_) => 2,
            RuntimeError::NotFound(_) => 3,
            _ => 1,
        }
    }
}

pub fn message_is_retryable(message: &str) -> bool {
    RETRYABLE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

impl From<serde_json::Error> for RuntimeError {
    fn from(error: serde_json::Error) -> Self {
        RuntimeError::Validation(format!("JSON serialisation error: {error}"))
    }
}

impl From<serde_yaml::Error> for RuntimeError {
    fn from(error: serde_yaml::Error) -> Self {
        RuntimeError::Validation(format!("YAML serialisation error: {error}"))
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(error: std::io::Error) -> Self {
        RuntimeError::Config(format!("IO error: {error}"))
    }
}

impl From<llm_contracts::LLMError> for RuntimeError {
    fn from(error: llm_contracts::LLMError) -> Self {
        match error {
            llm_contracts::LLMError::Timeout => {
                RuntimeError::Timeout("LLM call exceeded its deadline".to_string())
            }
            llm_contracts::LLMError::RateLimit => {
                RuntimeError::Execution("RESOURCE_BUSY: provider rate limit".to_string())
            }
            llm_contracts::LLMError::Network(message) => {
                RuntimeError::Execution(format!("NETWORK_ERROR: {message}"))
            }
            llm_contracts::LLMError::Configuration(message)
            | llm_contracts::LLMError::Authentication(message) => RuntimeError::Config(message),
            llm_contracts::LLMError::ModelNotFound(message) => RuntimeError::NotFound(message),
            other => RuntimeError::Execution(other.to_string()),
        }
    }
}
