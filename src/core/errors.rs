// src/core/errors.rs

//! Defines the primary error type for the coordinator.

use std::sync::Arc;
use thiserror::Error;

use crate::core::model::Pnn;

/// The main error enum, representing all possible failures within the coordinator.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait
/// implementations.
#[derive(Error, Debug, Clone)]
pub enum RecoverdError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Control RPC to node {pnn} timed out")]
    RpcTimeout { pnn: Pnn },

    #[error("Control RPC to node {pnn} failed: {reason}")]
    RpcFailed { pnn: Pnn, reason: String },

    #[error("no route to node {0}")]
    NoRoute(Pnn),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("recovery lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("self-banned for {seconds}s")]
    SelfBanned { seconds: u64 },

    #[error("operation gate is disabled")]
    GateDisabled,

    #[error("operation gate already in progress")]
    GateInProgress,

    #[error("election is in progress")]
    ElectionInProgress,

    #[error("no longer master")]
    NotMaster,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for RecoverdError {
    fn from(e: std::io::Error) -> Self {
        RecoverdError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for RecoverdError {
    fn from(e: toml::de::Error) -> Self {
        RecoverdError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecoverdError>;
