// Copyright (c) Signal Sync, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

const CYCLE_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120., 300.,
];

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,

    pub(crate) events_processed: IntCounterVec,
    pub(crate) events_deduped: IntCounter,
    pub(crate) grants_applied: IntCounter,
    pub(crate) grants_skipped: IntCounter,
    pub(crate) sync_errors: IntCounterVec,

    pub(crate) catchup_cycles: IntCounter,
    pub(crate) catchup_cycle_latency: Histogram,
    pub(crate) last_synced_block: IntGauge,
    pub(crate) latest_chain_block: IntGauge,

    pub(crate) live_events_received: IntCounter,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "signal_sync_requests_received",
                "Total number of requests received, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "signal_sync_requests_ok",
                "Total number of successful requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "signal_sync_err_requests",
                "Total number of failed requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            events_processed: register_int_counter_vec_with_registry!(
                "signal_sync_events_processed",
                "Total number of chain events handled successfully, by event type",
                &["event_type"],
                registry,
            )
            .unwrap(),
            events_deduped: register_int_counter_with_registry!(
                "signal_sync_events_deduped",
                "Total number of chain events skipped because they were already processed",
                registry,
            )
            .unwrap(),
            grants_applied: register_int_counter_with_registry!(
                "signal_sync_grants_applied",
                "Total number of new access grants recorded by the access-control API",
                registry,
            )
            .unwrap(),
            grants_skipped: register_int_counter_with_registry!(
                "signal_sync_grants_skipped",
                "Total number of grants skipped because they already existed or the signal is public",
                registry,
            )
            .unwrap(),
            sync_errors: register_int_counter_vec_with_registry!(
                "signal_sync_errors",
                "Total number of reconciliation errors, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            catchup_cycles: register_int_counter_with_registry!(
                "signal_sync_catchup_cycles",
                "Total number of catch-up cycles executed",
                registry,
            )
            .unwrap(),
            catchup_cycle_latency: register_histogram_with_registry!(
                "signal_sync_catchup_cycle_latency",
                "Duration of catch-up cycles in seconds",
                CYCLE_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            last_synced_block: register_int_gauge_with_registry!(
                "signal_sync_last_synced_block",
                "Highest block number covered by the durable checkpoint",
                registry,
            )
            .unwrap(),
            latest_chain_block: register_int_gauge_with_registry!(
                "signal_sync_latest_chain_block",
                "Chain head observed at the start of the most recent catch-up cycle",
                registry,
            )
            .unwrap(),
            live_events_received: register_int_counter_with_registry!(
                "signal_sync_live_events_received",
                "Total number of events delivered over the live subscription",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let registry = Registry::new();
        let metrics = SyncMetrics::new(&registry);

        metrics.events_processed.with_label_values(&["subscribed"]).inc();
        metrics.sync_errors.with_label_values(&["chain_unavailable"]).inc();
        metrics.grants_applied.inc();
        metrics.last_synced_block.set(42);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "signal_sync_events_processed"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "signal_sync_last_synced_block"));
    }

    #[test]
    fn test_new_for_testing_does_not_collide() {
        let _a = SyncMetrics::new_for_testing();
        let _b = SyncMetrics::new_for_testing();
    }
}
