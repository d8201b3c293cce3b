use std::sync::Arc;

use shared::error::ApiError;
use thiserror::Error;

use crate::{cache::CacheKey, call::CallState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// Retryable by caller policy; the stored credential is left untouched.
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("session is no longer authorized")]
    Unauthorized,
    #[error("refresh failed unexpectedly: {0}")]
    Unknown(String),
    #[error("refresh abandoned because the session was shut down")]
    Cancelled,
}

impl RefreshError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RefreshError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("cannot authenticate connection: {0}")]
    Auth(#[from] RefreshError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection is not authenticated")]
    NotConnected,
    #[error("server rejected the session: {0}")]
    Rejected(ApiError),
    #[error("connection attempt superseded by a newer epoch")]
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("cannot {action} while call is {from:?}")]
    InvalidTransition {
        from: CallState,
        action: &'static str,
    },
    #[error("a call is already in progress")]
    Busy,
    #[error("call signal not delivered: {0}")]
    Signal(#[from] ConnectionError),
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("loader for {key} failed: {cause}")]
    Loader {
        key: CacheKey,
        cause: Arc<anyhow::Error>,
    },
}

/// Error classes the UI boundary reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientNetwork,
    AuthExpired,
    AuthFatal,
    SignalingConflict,
    CacheLoader,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Refresh(err) => refresh_class(err),
            ClientError::Connection(ConnectionError::Auth(err)) => refresh_class(err),
            ClientError::Connection(ConnectionError::Rejected(api)) if api.code.is_session_fatal() => {
                ErrorClass::AuthExpired
            }
            ClientError::Connection(_) => ErrorClass::TransientNetwork,
            ClientError::Call(_) => ErrorClass::SignalingConflict,
            ClientError::Cache(_) => ErrorClass::CacheLoader,
        }
    }
}

fn refresh_class(err: &RefreshError) -> ErrorClass {
    if err.is_fatal() {
        ErrorClass::AuthFatal
    } else {
        ErrorClass::TransientNetwork
    }
}
