use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use tracing::{info, warn};

use crate::models::account::Account;
use crate::modules::persistence::writer::{ResolvedOp, StoreWriter};
use crate::proxy::provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    RateLimit,
    NonSuccess,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::NonSuccess => "non_success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failover(FailoverReason),
}

// Inspects status and rate-limit headers of one upstream attempt and books
// the consequences through the async writer. Metadata is only touched on a
// rate-limit signal or on success; a plain non-success fails over without
// marking the account.
pub struct Classifier {
    writer: Arc<StoreWriter>,
    session_ttl_secs: u64,
}

impl Classifier {
    pub fn new(writer: Arc<StoreWriter>, session_ttl_secs: u64) -> Self {
        Self {
            writer,
            session_ttl_secs,
        }
    }

    pub fn classify(
        &self,
        account: &Account,
        status: StatusCode,
        headers: &HeaderMap,
        now: i64,
    ) -> Verdict {
        let signal = provider::parse_rate_limit(status, headers, now);

        if signal.is_rate_limited {
            if let Some(reset_at) = signal.reset_at {
                warn!(
                    "Account {} rate limited until {} (status {})",
                    account.name, reset_at, status
                );
                self.writer.enqueue(ResolvedOp::MarkRateLimited {
                    account_id: account.id.clone(),
                    reset_at,
                });
                self.writer.enqueue(ResolvedOp::UpdateRateLimitMeta {
                    account_id: account.id.clone(),
                    status: signal.status_tag.clone(),
                    reset_at: signal.reset_at,
                    remaining: signal.remaining,
                });
                return Verdict::Failover(FailoverReason::RateLimit);
            }
            // Limited but no reset hint: fail over without a mark so the
            // account re-enters rotation immediately.
            warn!(
                "Account {} rate limited without reset header, failing over unmarked",
                account.name
            );
            return Verdict::Failover(FailoverReason::RateLimit);
        }

        if !status.is_success() {
            return Verdict::Failover(FailoverReason::NonSuccess);
        }

        self.writer.enqueue(ResolvedOp::IncrementUsage {
            account_id: account.id.clone(),
            count: 1,
            now,
            session_ttl_secs: self.session_ttl_secs,
        });
        if signal.status_tag.is_some() {
            self.writer.enqueue(ResolvedOp::UpdateRateLimitMeta {
                account_id: account.id.clone(),
                status: signal.status_tag,
                reset_at: signal.reset_at,
                remaining: signal.remaining,
            });
        }
        if let Some(tier) = provider::extract_tier_info(headers) {
            if tier != account.tier {
                info!(
                    "Account {} tier updated {} -> {}",
                    account.name,
                    account.tier.weight(),
                    tier.weight()
                );
                self.writer.enqueue(ResolvedOp::SetTier {
                    account_id: account.id.clone(),
                    tier,
                });
            }
        }

        Verdict::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Tier;
    use crate::modules::persistence::store::AccountStore;
    use crate::modules::persistence::writer::WriterConfig;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn setup() -> (Arc<AccountStore>, Arc<StoreWriter>, Classifier, Account) {
        let store = Arc::new(AccountStore::open_in_memory().unwrap());
        let writer = StoreWriter::spawn(store.clone(), WriterConfig::default());
        let classifier = Classifier::new(writer.clone(), 5 * 60 * 60);
        let account =
            Account::new_api_key("c".to_string(), Tier::Pro, "sk-c".to_string(), None);
        store.insert_account(&account).unwrap();
        (store, writer, classifier, account)
    }

    #[tokio::test]
    async fn test_rate_limited_response_marks_account() {
        let (store, writer, classifier, account) = setup();
        let now = chrono::Utc::now().timestamp();
        let reset_at = now + 600;

        let mut headers = HeaderMap::new();
        headers.insert(
            crate::constants::RATELIMIT_RESET_HEADER,
            HeaderValue::from_str(&reset_at.to_string()).unwrap(),
        );
        headers.insert(
            crate::constants::RATELIMIT_STATUS_HEADER,
            HeaderValue::from_static("rejected"),
        );

        let verdict =
            classifier.classify(&account, StatusCode::TOO_MANY_REQUESTS, &headers, now);
        assert_eq!(verdict, Verdict::Failover(FailoverReason::RateLimit));

        writer.shutdown(Duration::from_secs(2)).await;
        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.rate_limit_reset_at, Some(reset_at));
        assert_eq!(loaded.rate_limit_status.as_deref(), Some("rejected"));
        // Failed attempts never count as usage.
        assert_eq!(loaded.total_requests, 0);
    }

    #[tokio::test]
    async fn test_plain_non_success_fails_over_without_mark() {
        let (store, writer, classifier, account) = setup();
        let now = chrono::Utc::now().timestamp();

        let verdict = classifier.classify(
            &account,
            StatusCode::from_u16(529).unwrap(),
            &HeaderMap::new(),
            now,
        );
        assert_eq!(verdict, Verdict::Failover(FailoverReason::NonSuccess));

        writer.shutdown(Duration::from_secs(2)).await;
        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.rate_limit_reset_at, None);
        assert_eq!(loaded.total_requests, 0);
    }

    #[tokio::test]
    async fn test_success_increments_usage_and_records_meta() {
        let (store, writer, classifier, account) = setup();
        let now = chrono::Utc::now().timestamp();

        let mut headers = HeaderMap::new();
        headers.insert(
            crate::constants::RATELIMIT_STATUS_HEADER,
            HeaderValue::from_static("allowed"),
        );
        headers.insert(
            crate::constants::RATELIMIT_REMAINING_HEADER,
            HeaderValue::from_static("41"),
        );

        let verdict = classifier.classify(&account, StatusCode::OK, &headers, now);
        assert_eq!(verdict, Verdict::Success);

        writer.shutdown(Duration::from_secs(2)).await;
        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.total_requests, 1);
        assert_eq!(loaded.request_count, 1);
        assert_eq!(loaded.rate_limit_status.as_deref(), Some("allowed"));
        assert_eq!(loaded.rate_limit_remaining, Some(41));
    }

    #[tokio::test]
    async fn test_tier_update_detected_on_success() {
        let (store, writer, classifier, account) = setup();
        let now = chrono::Utc::now().timestamp();

        let mut headers = HeaderMap::new();
        headers.insert(
            "anthropic-ratelimit-unified-tier",
            HeaderValue::from_static("max_20x"),
        );

        classifier.classify(&account, StatusCode::OK, &headers, now);
        writer.shutdown(Duration::from_secs(2)).await;
        let loaded = store.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.tier, Tier::Max20);
    }
}
