//! External advertising-platform interface
//!
//! The platform is consumed through this trait only. Calls carry a
//! per-call timeout and, when idempotent, a bounded retry budget with
//! exponential backoff and jitter. Idempotency tokens derive
//! deterministically from `(batch_item_id, attempt)` so a retried write
//! is safe to replay.

use crate::models::{EntityStatus, MatchType, PerformanceSnapshot};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("credentials rejected")]
    AuthExpired,
    #[error("platform returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
}

impl ApiError {
    /// Retry only transient faults; 4xx and auth failures will not heal
    /// by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::RateLimited | ApiError::Network(_) => true,
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::AuthExpired => false,
        }
    }
}

/// Deterministic client token for one write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(Uuid);

impl IdempotencyToken {
    pub fn derive(batch_item_id: i64, attempt: u32) -> Self {
        let name = format!("batch-item:{}:attempt:{}", batch_item_id, attempt);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
pub trait AdsApi: Send + Sync {
    async fn update_target_bid(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        target_id: i64,
        bid: f64,
    ) -> Result<(), ApiError>;

    async fn create_negative_keyword(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        campaign_id: i64,
        ad_group_id: Option<i64>,
        keyword: &str,
        match_type: MatchType,
    ) -> Result<(), ApiError>;

    async fn remove_negative_keyword(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        campaign_id: i64,
        keyword: &str,
        match_type: MatchType,
    ) -> Result<(), ApiError>;

    async fn create_keyword(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        campaign_id: i64,
        ad_group_id: i64,
        keyword: &str,
        match_type: MatchType,
        bid: f64,
    ) -> Result<(), ApiError>;

    async fn archive_target(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        target_id: i64,
    ) -> Result<(), ApiError>;

    async fn set_campaign_status(
        &self,
        token: &IdempotencyToken,
        account_id: i64,
        campaign_id: i64,
        status: EntityStatus,
    ) -> Result<(), ApiError>;

    /// Re-fetch authoritative report rows for a date range (backfill
    /// repair path).
    async fn fetch_report_rows(
        &self,
        account_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PerformanceSnapshot>, ApiError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.as_millis() as u64 * (1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }
}

/// Drive an idempotent call through the timeout and retry budget. The
/// closure receives the attempt number so it can derive a fresh token.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff_with_jitter(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying platform call"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// In-process recording implementation
// =============================================================================

/// What the fake saw, for assertions and dry-run inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    UpdateBid {
        target_id: i64,
        bid: f64,
        token: String,
    },
    CreateNegative {
        campaign_id: i64,
        keyword: String,
        match_type: MatchType,
    },
    RemoveNegative {
        campaign_id: i64,
        keyword: String,
    },
    CreateKeyword {
        campaign_id: i64,
        keyword: String,
        bid: f64,
    },
    ArchiveTarget {
        target_id: i64,
    },
    SetCampaignStatus {
        campaign_id: i64,
        status: EntityStatus,
    },
}

/// Recording fake: succeeds by default, with injectable failures per
/// target and a global auth-expiry switch.
#[derive(Default)]
pub struct RecordingAdsApi {
    calls: Mutex<Vec<RecordedCall>>,
    failing_targets: Mutex<HashSet<i64>>,
    auth_expired: AtomicBool,
    transient_failures: Mutex<u32>,
}

impl RecordingAdsApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_target(&self, target_id: i64) {
        self.failing_targets.lock().insert(target_id);
    }

    pub fn expire_auth(&self) {
        self.auth_expired.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a retryable network error.
    pub fn inject_transient_failures(&self, n: u32) {
        *self.transient_failures.lock() = n;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn gate(&self) -> Result<(), ApiError> {
        if self.auth_expired.load(Ordering::SeqCst) {
            return Err(ApiError::AuthExpired);
        }
        let mut transient = self.transient_failures.lock();
        if *transient > 0 {
            *transient -= 1;
            return Err(ApiError::Network("injected transient failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AdsApi for RecordingAdsApi {
    async fn update_target_bid(
        &self,
        token: &IdempotencyToken,
        _account_id: i64,
        target_id: i64,
        bid: f64,
    ) -> Result<(), ApiError> {
        self.gate()?;
        if self.failing_targets.lock().contains(&target_id) {
            return Err(ApiError::Http {
                status: 404,
                message: format!("target {} not found", target_id),
            });
        }
        self.calls.lock().push(RecordedCall::UpdateBid {
            target_id,
            bid,
            token: token.to_string(),
        });
        Ok(())
    }

    async fn create_negative_keyword(
        &self,
        _token: &IdempotencyToken,
        _account_id: i64,
        campaign_id: i64,
        _ad_group_id: Option<i64>,
        keyword: &str,
        match_type: MatchType,
    ) -> Result<(), ApiError> {
        self.gate()?;
        self.calls.lock().push(RecordedCall::CreateNegative {
            campaign_id,
            keyword: keyword.to_string(),
            match_type,
        });
        Ok(())
    }

    async fn remove_negative_keyword(
        &self,
        _token: &IdempotencyToken,
        _account_id: i64,
        campaign_id: i64,
        keyword: &str,
        _match_type: MatchType,
    ) -> Result<(), ApiError> {
        self.gate()?;
        self.calls.lock().push(RecordedCall::RemoveNegative {
            campaign_id,
            keyword: keyword.to_string(),
        });
        Ok(())
    }

    async fn create_keyword(
        &self,
        _token: &IdempotencyToken,
        _account_id: i64,
        campaign_id: i64,
        _ad_group_id: i64,
        keyword: &str,
        _match_type: MatchType,
        bid: f64,
    ) -> Result<(), ApiError> {
        self.gate()?;
        self.calls.lock().push(RecordedCall::CreateKeyword {
            campaign_id,
            keyword: keyword.to_string(),
            bid,
        });
        Ok(())
    }

    async fn archive_target(
        &self,
        _token: &IdempotencyToken,
        _account_id: i64,
        target_id: i64,
    ) -> Result<(), ApiError> {
        self.gate()?;
        self.calls.lock().push(RecordedCall::ArchiveTarget { target_id });
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        _token: &IdempotencyToken,
        _account_id: i64,
        campaign_id: i64,
        status: EntityStatus,
    ) -> Result<(), ApiError> {
        self.gate()?;
        self.calls
            .lock()
            .push(RecordedCall::SetCampaignStatus { campaign_id, status });
        Ok(())
    }

    async fn fetch_report_rows(
        &self,
        _account_id: i64,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<PerformanceSnapshot>, ApiError> {
        self.gate()?;
        Ok(Vec::new())
    }
}
