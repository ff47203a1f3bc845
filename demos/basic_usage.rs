// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic healthing-sync usage example.
//!
//! Demonstrates:
//! 1. Starting a client over a local SQLite queue and an in-memory remote
//! 2. Live submissions (accepted and rejected)
//! 3. Going offline and saving submissions locally
//! 4. A key consumed by another device while we were offline
//! 5. Reconnecting and watching the queue drain
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use healthing_sync::{
    ClientState, Connectivity, LocalStore, MemoryRemote, SubmitClient, SubmitClientConfig,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the client emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           healthing-sync: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the client
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring client...");

    let db_path = std::env::temp_dir().join("healthing_sync_demo.db");
    let _ = std::fs::remove_file(&db_path);

    let remote = Arc::new(
        MemoryRemote::new()
            .with_identifier("P-1001")
            .with_identifier("P-1002")
            .with_key("HK-AAAA", false)
            .with_key("HK-BBBB", false)
            .with_key("HK-CCCC", false)
            .with_key("HK-DDDD", false)
            .with_key("HK-USED", true),
    );

    let config = SubmitClientConfig {
        local_store_path: db_path.to_string_lossy().to_string(),
        // Probe quickly for the demo
        probe_interval_ms: 500,
        ..Default::default()
    };

    let store = Arc::new(LocalStore::new(&config.local_store_path));
    let client = Arc::new(SubmitClient::with_backends(
        config,
        store,
        remote.clone(),
        Connectivity::Offline,
    ));

    // Print every user-facing notice as it arrives
    let mut notices = client.notices();
    let printer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("   📣 {}", notice);
        }
    });

    println!("   State: {}", client.state());
    println!("\n🚀 Starting client (probing remote)...");
    client.start().await?;
    assert_eq!(client.state(), ClientState::Running);
    println!("   ✅ Running, online = {}", client.is_online());
    let refreshed = client.refresh_cache().await;
    println!("   └─ Identifier cache: {:?}", refreshed);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Live submissions
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Submitting online...");
    for (pid, key) in [("P-1001", "HK-AAAA"), ("P-1001", "HK-USED"), ("P-9999", "HK-BBBB"), ("P-1002", "NOPE")] {
        match client.submit(pid, key).await {
            Ok(outcome) => println!("   ✅ {} / {} → {:?}", pid, key, outcome),
            Err(e) => println!("   ❌ {} / {} → {}", pid, key, e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline: submissions are saved locally
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Going offline...");
    remote.set_reachable(false);
    client.set_online(false);
    tokio::time::sleep(Duration::from_millis(50)).await;

    for (pid, key) in [("P-1001", "HK-BBBB"), ("P-1002", "HK-CCCC"), ("P-1002", "HK-DDDD")] {
        match client.submit(pid, key).await {
            Ok(outcome) => println!("   💾 {} / {} → {:?}", pid, key, outcome),
            Err(e) => println!("   ❌ {} / {} → {}", pid, key, e),
        }
    }
    println!("   └─ Pending: {}", client.pending_count().await?);

    // A background-sync event while offline leaves everything queued
    if let Some(report) = client.handle_background_trigger("sync-submissions").await {
        println!("   └─ Background sync while offline: {}", report);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Another device uses one of our queued keys
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📱 Another device consumes HK-CCCC...");
    remote.consume_elsewhere("HK-CCCC");

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Back online: the reconciler drains the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Coming back online...");
    remote.set_reachable(true);
    client.set_online(true);

    for _ in 0..100 {
        if client.pending_count().await? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("   └─ Pending: {}", client.pending_count().await?);

    println!("\n📜 History for P-1002:");
    for record in client.history("P-1002").await? {
        println!("   └─ {} at {}", record.healthing_key, record.timestamp);
    }

    let stats = client.queue_stats().await?;
    println!(
        "\n📊 Queue: pending={} enqueued={} removed={}",
        stats.pending, stats.total_enqueued, stats.total_removed
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics snapshot:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    client.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", client.state());
    drop(client);
    printer.abort();

    println!("\n🧹 Cleaning up local store...");
    for suffix in ["", "-shm", "-wal"] {
        let mut path = db_path.clone().into_os_string();
        path.push(suffix);
        let _ = std::fs::remove_file(path);
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    gauges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.0}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum, max) in &histograms {
            println!("      └─ {}{} count={} sum={:.4}s max={:.4}s", name, labels, count, sum, max);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
