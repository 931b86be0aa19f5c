// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service-level error taxonomy.
//!
//! Every failure a caller can observe is one [`ServiceError`]. The request
//! boundary turns it into a status code via [`ServiceError::status_code`];
//! nothing below the boundary knows about transports.

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid UDI format")]
    InvalidIdentifier,

    #[error("Document not found")]
    NotFound,

    #[error("Posted data too large ({size} bytes, limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Unable to generate a unique identifier")]
    IdentifierExhausted,

    #[error("Storage fault: {0}")]
    StorageFault(#[from] StorageError),

    #[error("The client_id is not authorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Method Not Allowed")]
    MethodNotAllowed,
}

impl ServiceError {
    /// Transport status for this error (HTTP semantics).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidIdentifier | Self::BadRequest(_) => 400,
            Self::Unauthorized => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::PayloadTooLarge { .. } => 413,
            Self::RateLimited { .. } => 429,
            Self::IdentifierExhausted | Self::StorageFault(_) => 500,
        }
    }

    /// Operator-visible faults, as opposed to ordinary client rejections.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::IdentifierExhausted | Self::StorageFault(_))
    }

    /// Stable label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier => "invalid_identifier",
            Self::NotFound => "not_found",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::IdentifierExhausted => "identifier_exhausted",
            Self::StorageFault(_) => "storage_fault",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::MethodNotAllowed => "method_not_allowed",
        }
    }
}
