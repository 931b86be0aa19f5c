// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport-neutral request boundary.
//!
//! The embedding HTTP layer extracts an [`ApiRequest`] (method, client id,
//! optional `udi` parameter, body, peer address and `X-Forwarded-For`) and
//! writes back the [`ApiResponse`]. Everything between is here:
//!
//! ```text
//! client_id present? ──no──> 400
//!        │
//! client_id allowed? ──no──> 403
//!        │
//! caller address ──> salted hash (raw address dropped)
//!        │
//! rate gate ──denied──> 429     ──unavailable──> 500 (or admit if fail-open)
//!        │
//! PUT  create   udi must be absent, body non-empty, body <= max_payload_size
//! POST update   udi required, body non-empty, body <= max_payload_size
//! GET  read     udi required
//! *    405
//! ```
//!
//! Success bodies are `OK:<UDI>\n` for create/update and the raw payload for
//! read. Error bodies are the error message.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock::{SystemTimeSource, TimeSource};
use crate::config::{ClientPolicy, ConfigError, ServiceConfig};
use crate::error::ServiceError;
use crate::maintenance::Maintenance;
use crate::metrics;
use crate::rate_limit::{hash_address, RateLimitError, RateLimiter};
use crate::service::DocumentService;
use crate::storage::{self, DocumentStore, StorageError};
use crate::udi::Udi;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage unavailable: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Other(String),
}

impl From<&str> for Method {
    fn from(method: &str) -> Self {
        match method {
            "GET" => Self::Get,
            "PUT" => Self::Put,
            "POST" => Self::Post,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Put => f.write_str("PUT"),
            Self::Post => f.write_str("POST"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub client_id: Option<String>,
    pub udi: Option<String>,
    pub body: Vec<u8>,
    pub remote_addr: Option<String>,
    /// Raw `X-Forwarded-For` header value.
    pub forwarded_for: Option<String>,
}

impl ApiRequest {
    pub fn new(method: impl Into<Method>, client_id: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            client_id: Some(client_id.into()),
            udi: None,
            body: Vec::new(),
            remote_addr: None,
            forwarded_for: None,
        }
    }

    #[must_use]
    pub fn with_udi(mut self, udi: impl Into<String>) -> Self {
        self.udi = Some(udi.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    fn ok_udi(udi: &Udi) -> Self {
        Self {
            status: 200,
            body: format!("OK:{udi}\n").into_bytes(),
        }
    }

    fn from_error(err: &ServiceError) -> Self {
        Self {
            status: err.status_code(),
            body: err.to_string().into_bytes(),
        }
    }

    /// Body as text, lossy.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// First `X-Forwarded-For` entry, else the peer address.
fn caller_address<'a>(forwarded_for: Option<&'a str>, remote_addr: Option<&'a str>) -> Option<&'a str> {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .or_else(|| remote_addr.map(str::trim).filter(|addr| !addr.is_empty()))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub struct Gateway {
    config: ServiceConfig,
    service: DocumentService,
    limiter: RateLimiter,
    clock: Arc<dyn TimeSource>,
}

impl Gateway {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.operation_timeout();
        Ok(Self {
            service: DocumentService::new(store.clone(), clock.clone(), timeout),
            limiter: RateLimiter::new(store, clock.clone(), timeout),
            clock,
            config,
        })
    }

    /// Validate `config`, open its storage backend and build a gateway on the
    /// system clock.
    pub async fn open(config: ServiceConfig) -> Result<Self, StartupError> {
        Self::open_with_clock(config, Arc::new(SystemTimeSource)).await
    }

    /// As [`Gateway::open`], with one clock shared by the backend's document
    /// timestamps, the rate limiter and retention.
    pub async fn open_with_clock(
        config: ServiceConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let store = storage::open(&config.storage, clock.clone()).await?;
        Ok(Self::new(config, store, clock)?)
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn service(&self) -> &DocumentService {
        &self.service
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Stats and retention over this gateway's backend, using the configured
    /// retention period.
    #[must_use]
    pub fn maintenance(&self) -> Maintenance<'_> {
        Maintenance::new(&self.service, self.config.max_retention_days)
    }

    /// Handle one request. Never fails: every error becomes a status.
    #[tracing::instrument(skip(self, request), fields(method = %request.method))]
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                metrics::record_error("request", err.kind());
                debug!(status = err.status_code(), error = %err, "request rejected");
                ApiResponse::from_error(&err)
            }
        }
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, ServiceError> {
        let ApiRequest {
            method,
            client_id,
            udi,
            body,
            remote_addr,
            forwarded_for,
        } = request;

        let client_id = non_blank(client_id.as_deref())
            .ok_or_else(|| ServiceError::BadRequest("Missing client_id".into()))?;
        let policy = self.config.client(client_id).ok_or(ServiceError::Unauthorized)?;

        let ip_hash = caller_address(forwarded_for.as_deref(), remote_addr.as_deref())
            .map(|addr| hash_address(&self.config.salt, addr));
        drop(forwarded_for);
        drop(remote_addr);

        if policy.ip_locked && ip_hash.is_none() {
            return Err(ServiceError::BadRequest("Unable to determine client address".into()));
        }

        self.gate(client_id, ip_hash.as_deref(), policy).await?;

        let udi = non_blank(udi.as_deref());
        match method {
            Method::Put => {
                if udi.is_some() {
                    return Err(ServiceError::BadRequest(
                        "Udi must not be set when creating a new document".into(),
                    ));
                }
                check_body(&body, policy)?;
                let udi = self.service.create(&body, policy.max_payload_size).await?;
                Ok(ApiResponse::ok_udi(&udi))
            }
            Method::Post => {
                let udi = udi.ok_or_else(|| ServiceError::BadRequest("Missing udi".into()))?;
                check_body(&body, policy)?;
                let udi = Udi::parse_lenient(udi)?;
                let udi = self
                    .service
                    .update(udi.as_str(), &body, policy.max_payload_size)
                    .await?;
                Ok(ApiResponse::ok_udi(&udi))
            }
            Method::Get => {
                let udi = udi.ok_or_else(|| ServiceError::BadRequest("Missing udi".into()))?;
                let udi = Udi::parse_lenient(udi)?;
                let data = self.service.read(udi.as_str()).await?;
                Ok(ApiResponse { status: 200, body: data })
            }
            Method::Other(_) => Err(ServiceError::MethodNotAllowed),
        }
    }

    async fn gate(
        &self,
        client_id: &str,
        ip_hash: Option<&str>,
        policy: &ClientPolicy,
    ) -> Result<(), ServiceError> {
        match self.limiter.check(client_id, ip_hash, policy).await {
            Ok(decision) if decision.is_allowed() => Ok(()),
            Ok(decision) => Err(ServiceError::RateLimited {
                retry_after_secs: decision.retry_after_secs(self.clock.now_secs()),
            }),
            Err(RateLimitError::Unavailable(e)) if self.config.rate_limit_fail_open => {
                warn!(client_id, error = %e, "rate limiter unavailable, admitting (fail-open)");
                Ok(())
            }
            Err(RateLimitError::Unavailable(e)) => {
                error!(client_id, error = %e, "rate limiter unavailable, rejecting");
                Err(ServiceError::StorageFault(e))
            }
        }
    }
}

fn check_body(body: &[u8], policy: &ClientPolicy) -> Result<(), ServiceError> {
    if body.is_empty() {
        return Err(ServiceError::BadRequest("Missing posted data".into()));
    }
    if body.len() > policy.max_payload_size {
        return Err(ServiceError::PayloadTooLarge {
            size: body.len(),
            limit: policy.max_payload_size,
        });
    }
    Ok(())
}
