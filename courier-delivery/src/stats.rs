//! Delivery statistics

use courier_core::{success_rate, CourierResult, SystemStats, Webhook};
use courier_storage::WebhookStore;

use crate::index::SubscriptionIndex;

/// Aggregate counters across every webhook of every tenant.
pub async fn system_stats(
    store: &dyn WebhookStore,
    index: &SubscriptionIndex,
) -> CourierResult<SystemStats> {
    let webhooks = store.webhook_list().await?;
    let pending_deliveries = store.delivery_count().await?;
    Ok(aggregate(&webhooks, pending_deliveries, index.pattern_count()))
}

fn aggregate(webhooks: &[Webhook], pending_deliveries: usize, patterns: usize) -> SystemStats {
    let total_deliveries: u64 = webhooks.iter().map(|w| w.delivery_count).sum();
    let total_failures: u64 = webhooks.iter().map(|w| w.failure_count).sum();

    SystemStats {
        total_webhooks: webhooks.len(),
        active_webhooks: webhooks.iter().filter(|w| w.active).count(),
        total_deliveries,
        total_failures,
        success_rate: success_rate(total_deliveries, total_failures),
        pending_deliveries,
        subscribed_patterns: patterns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::RetryPolicy;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn webhook(delivered: u64, failed: u64, active: bool) -> Webhook {
        let now = Utc::now();
        Webhook {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            url: "https://example.test/hook".to_string(),
            events: vec!["*".to_string()],
            secret: "whsec_stats".to_string(),
            previous_secret: None,
            active,
            headers: BTreeMap::new(),
            timeout_ms: 1_000,
            retry_policy: RetryPolicy::Stepped,
            delivery_count: delivered,
            failure_count: failed,
            last_delivery: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_aggregate_sums_counters() {
        let hooks = vec![webhook(6, 1, true), webhook(4, 1, false)];
        let stats = aggregate(&hooks, 3, 2);
        assert_eq!(stats.total_webhooks, 2);
        assert_eq!(stats.active_webhooks, 1);
        assert_eq!(stats.total_deliveries, 10);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.success_rate - 80.0).abs() < f64::EPSILON);
        assert_eq!(stats.pending_deliveries, 3);
        assert_eq!(stats.subscribed_patterns, 2);
    }

    #[test]
    fn test_aggregate_empty_is_zero_rate() {
        let stats = aggregate(&[], 0, 0);
        assert_eq!(stats.total_webhooks, 0);
        assert_eq!(stats.success_rate, 0.0);
    }
}
