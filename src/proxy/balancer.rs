use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::models::account::Account;
use crate::modules::persistence::writer::{ResolvedOp, StoreWriter};

// Session-sticky weighted account selection. Selection is deterministic:
// each account carries a per-process selection counter, its virtual queue
// depth is ceil(count / tier_weight), and candidates are ordered by depth
// ascending so a tier-20 account absorbs ~20x the traffic of a tier-1
// account over many requests. Ties break least-recently-used, then by id.
pub struct LoadBalancer {
    writer: Arc<StoreWriter>,
    selection_counts: DashMap<String, u64>,
    session_ttl_secs: u64,
    reset_request_count_on_clear: bool,
}

impl LoadBalancer {
    pub fn new(
        writer: Arc<StoreWriter>,
        session_ttl_secs: u64,
        reset_request_count_on_clear: bool,
    ) -> Self {
        Self {
            writer,
            selection_counts: DashMap::new(),
            session_ttl_secs,
            reset_request_count_on_clear,
        }
    }

    // Returns the ordered candidate list for one request. An empty list means
    // no account can serve; the orchestrator falls back to an
    // unauthenticated pass-through.
    pub fn select(&self, accounts: &[Account], now: i64) -> Vec<Account> {
        let mut eligible: Vec<&Account> = Vec::new();
        for account in accounts {
            if account.paused {
                continue;
            }
            if let Some(reset_at) = account.rate_limit_reset_at {
                if reset_at > now {
                    continue;
                }
                // Expired limit: clear lazily, the guard in the store keeps
                // this idempotent against racing marks.
                self.writer.enqueue(ResolvedOp::ClearRateLimit {
                    account_id: account.id.clone(),
                    reset_request_count: self.reset_request_count_on_clear,
                });
            }
            if !account.has_usable_credentials() {
                continue;
            }
            eligible.push(account);
        }

        if eligible.is_empty() {
            return Vec::new();
        }

        // At most one session leader: the account with the freshest still
        // active session window.
        let leader_id = eligible
            .iter()
            .filter(|a| {
                a.session_start
                    .is_some_and(|start| now - start < self.session_ttl_secs as i64)
            })
            .max_by_key(|a| a.session_start.unwrap_or(0))
            .map(|a| a.id.clone());

        let mut rest: Vec<&Account> = eligible
            .iter()
            .copied()
            .filter(|a| Some(&a.id) != leader_id.as_ref())
            .collect();
        rest.sort_by(|a, b| {
            self.depth(a)
                .cmp(&self.depth(b))
                .then(a.session_start.unwrap_or(0).cmp(&b.session_start.unwrap_or(0)))
                .then(a.id.cmp(&b.id))
        });

        let mut ordered: Vec<Account> = Vec::with_capacity(eligible.len());
        if let Some(leader_id) = &leader_id {
            if let Some(leader) = eligible.iter().find(|a| &a.id == leader_id) {
                debug!("Session leader {} placed first", leader.name);
                ordered.push((*leader).clone());
            }
        } else if let Some(first) = rest.first() {
            // Only non-sticky selections advance the weighted rotation.
            *self.selection_counts.entry(first.id.clone()).or_insert(0) += 1;
        }
        ordered.extend(rest.into_iter().cloned());

        ordered
    }

    fn depth(&self, account: &Account) -> u64 {
        let count = self
            .selection_counts
            .get(&account.id)
            .map(|c| *c)
            .unwrap_or(0);
        let weight = account.tier.weight();
        count.div_ceil(weight)
    }
}
