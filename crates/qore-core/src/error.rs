// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the federation engine
//!
//! Row-source, host and member failures are all mapped to these variants.
//! Host and backend messages are carried verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all federation operations
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum FederationError {
    #[error("Table name already in use: {name}")]
    NameInUse { name: String },

    #[error("{message}")]
    HostRejected { message: String },

    #[error("Table not found: {name}")]
    NotFound { name: String },

    #[error("Row {ordinal} does not exist")]
    RowNotFound { ordinal: usize },

    #[error("{message}")]
    ReadOnly { message: String },

    #[error("Operation not supported: {message}")]
    Unsupported { message: String },

    #[error("Member already attached: {member}")]
    AlreadyAttached { member: String },

    #[error("Member not attached: {member}")]
    NotAttached { member: String },

    #[error("Only one member can be attached without a namespace")]
    DuplicateUnnamespaced,

    #[error("Namespace already in use: {namespace}")]
    NamespaceInUse { namespace: String },

    #[error("Stale cursor: {message}")]
    Stale { message: String },

    #[error("{message}")]
    Source { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl FederationError {
    pub fn name_in_use(name: impl Into<String>) -> Self {
        Self::NameInUse { name: name.into() }
    }

    pub fn host_rejected(msg: impl Into<String>) -> Self {
        Self::HostRejected { message: msg.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn row_not_found(ordinal: usize) -> Self {
        Self::RowNotFound { ordinal }
    }

    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly { message: msg.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported { message: msg.into() }
    }

    pub fn already_attached(member: impl Into<String>) -> Self {
        Self::AlreadyAttached { member: member.into() }
    }

    pub fn not_attached(member: impl Into<String>) -> Self {
        Self::NotAttached { member: member.into() }
    }

    pub fn namespace_in_use(namespace: impl Into<String>) -> Self {
        Self::NamespaceInUse { namespace: namespace.into() }
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        Self::Stale { message: msg.into() }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    /// The read-only error every source without the matching capability returns.
    pub fn read_only_source() -> Self {
        Self::read_only("Data model representing the table is read only")
    }
}

/// Result type alias for federation operations
pub type FederationResult<T> = Result<T, FederationError>;
