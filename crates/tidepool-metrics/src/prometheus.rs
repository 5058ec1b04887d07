//! Prometheus text exposition format.
//!
//! Renders pool accounting, windowed aggregates, and cache counters for
//! scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use tidepool_cache::CacheStats;
use tidepool_pool::PoolStats;

use crate::monitor::PoolAggregate;

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render pool stats, aggregates, and optional cache stats as Prometheus text.
///
/// Pool series carry a `pool` label; cache series are unlabelled.
pub fn render_prometheus(
    pools: &[PoolStats],
    aggregates: &[PoolAggregate],
    cache: Option<&CacheStats>,
) -> String {
    let mut out = String::new();

    let gauges: [(&str, &str, fn(&PoolStats) -> f64); 6] = [
        ("tidepool_pool_utilization", "Active connections over target size (0.0-1.0).", |s| s.utilization()),
        ("tidepool_pool_active_connections", "Connections on loan.", |s| s.active as f64),
        ("tidepool_pool_idle_connections", "Connections parked idle.", |s| s.idle as f64),
        ("tidepool_pool_target_size", "Current target size.", |s| s.target as f64),
        ("tidepool_pool_queue_length", "Callers waiting for a connection.", |s| s.waiting as f64),
        ("tidepool_pool_health", "Pool health (0 healthy, 1 degraded, 2 unhealthy).", |s| f64::from(s.health.as_u8())),
    ];
    for (name, help, value) in gauges {
        family(&mut out, name, "gauge", help);
        for s in pools {
            let _ = writeln!(out, "{name}{{pool=\"{}\"}} {}", s.id, value(s));
        }
    }

    let counters: [(&str, &str, fn(&PoolStats) -> u64); 4] = [
        ("tidepool_pool_waits_total", "Acquires that had to queue.", |s| s.wait_count),
        ("tidepool_pool_connections_created_total", "Connections opened.", |s| s.created),
        ("tidepool_pool_connections_destroyed_total", "Connections closed.", |s| s.destroyed),
        ("tidepool_pool_creation_failures_total", "Failed connection attempts.", |s| s.creation_failures),
    ];
    for (name, help, value) in counters {
        family(&mut out, name, "counter", help);
        for s in pools {
            let _ = writeln!(out, "{name}{{pool=\"{}\"}} {}", s.id, value(s));
        }
    }

    family(&mut out, "tidepool_acquire_latency_avg_ms", "gauge", "Average acquire latency over the sample window.");
    for a in aggregates {
        let _ = writeln!(out, "tidepool_acquire_latency_avg_ms{{pool=\"{}\"}} {:.3}", a.pool_id, a.avg_acquire_ms);
    }
    family(&mut out, "tidepool_query_latency_avg_ms", "gauge", "Average query latency over the sample window.");
    for a in aggregates {
        let _ = writeln!(out, "tidepool_query_latency_avg_ms{{pool=\"{}\"}} {:.3}", a.pool_id, a.avg_query_ms);
    }
    family(&mut out, "tidepool_error_rate", "gauge", "Error rate over the sample window (0.0-1.0).");
    for a in aggregates {
        let _ = writeln!(out, "tidepool_error_rate{{pool=\"{}\"}} {:.4}", a.pool_id, a.error_rate);
    }

    if let Some(c) = cache {
        family(&mut out, "tidepool_cache_hit_rate", "gauge", "Cache hits over lookups (0.0-1.0).");
        let _ = writeln!(out, "tidepool_cache_hit_rate {:.4}", c.hit_rate());
        family(&mut out, "tidepool_cache_entries", "gauge", "Entries held.");
        let _ = writeln!(out, "tidepool_cache_entries {}", c.entries);
        family(&mut out, "tidepool_cache_size_bytes", "gauge", "Approximate bytes held.");
        let _ = writeln!(out, "tidepool_cache_size_bytes {}", c.size_bytes);
        for (name, help, value) in [
            ("tidepool_cache_hits_total", "Cache hits.", c.hits),
            ("tidepool_cache_misses_total", "Cache misses.", c.misses),
            ("tidepool_cache_evictions_total", "LRU evictions.", c.evictions),
            ("tidepool_cache_expirations_total", "Entries removed after their TTL.", c.expirations),
            ("tidepool_cache_rejections_total", "Writes and oversized values not cached.", c.rejections),
        ] {
            family(&mut out, name, "counter", help);
            let _ = writeln!(out, "{name} {value}");
        }
    }

    out
}
