//! Query-latency and per-k result reporting, the same shape as the
//! original experiment driver's `writeLatencyStats`/`writeQueryResults`
//! (percentile latencies, QPS, then one line of hits per query per k).

use spfresh_engine::SearchHit;
use std::time::Duration;

pub struct QueryOutcome {
    pub query_idx: usize,
    pub latency: Duration,
    pub hits: Vec<SearchHit>,
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

pub fn print_latency_stats(label: &str, outcomes: &[QueryOutcome], wall_time: Duration) {
    let mut latencies_us: Vec<f64> = outcomes
        .iter()
        .map(|o| o.latency.as_secs_f64() * 1e6)
        .collect();
    latencies_us.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mean = if latencies_us.is_empty() {
        0.0
    } else {
        latencies_us.iter().sum::<f64>() / latencies_us.len() as f64
    };
    let p95 = percentile(&latencies_us, 95.0);
    let p99 = percentile(&latencies_us, 99.0);
    let p999 = percentile(&latencies_us, 99.9);
    let qps = if wall_time.as_secs_f64() > 0.0 {
        outcomes.len() as f64 / wall_time.as_secs_f64()
    } else {
        0.0
    };

    println!("# {label}");
    println!("# Latency (us): mean={mean:.2}  P95={p95:.2}  P99={p99:.2}  P99.9={p999:.2}");
    println!(
        "# QPS={qps:.2}  total_queries={}  wall_time={:.6}s",
        outcomes.len(),
        wall_time.as_secs_f64()
    );
}

pub fn print_results_at_k(label: &str, k: usize, outcomes: &[QueryOutcome]) {
    println!("# {label} (queries={}, k={k})", outcomes.len());
    for outcome in outcomes {
        print!("Query {}:", outcome.query_idx);
        for hit in outcome.hits.iter().take(k) {
            print!(" [VID={} Dist={:.6}]", hit.vid.0, hit.distance);
        }
        println!();
    }
    println!();
}
