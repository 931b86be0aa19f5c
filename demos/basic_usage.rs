// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic blob-vault usage example.
//!
//! Demonstrates:
//! 1. Opening a filesystem-backed vault in a scratch directory
//! 2. Creating a document (PUT) and reading it back (GET)
//! 3. Overwriting it (POST)
//! 4. Hitting the per-client rate limit
//! 5. Printing storage statistics
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=blob_vault=debug cargo run --example basic_usage
//! ```

use blob_vault::{ApiRequest, ClientPolicy, Gateway, ServiceConfig, StorageConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             blob-vault: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the vault
    // ─────────────────────────────────────────────────────────────────────────
    let scratch = tempfile::tempdir()?;
    let mut config = ServiceConfig {
        storage: StorageConfig::File {
            path: scratch.path().join("vault"),
            counter_locking: Default::default(),
        },
        salt: "demo-salt".into(),
        ..Default::default()
    };
    config.clients.insert(
        "demo".into(),
        ClientPolicy {
            max_payload_size: 1024,
            window_seconds: 60,
            max_requests_per_window: 5,
            ip_locked: true,
        },
    );

    let gateway = Gateway::open(config).await?;
    println!("📦 Vault opened at {}\n", scratch.path().display());

    let request = |method: &str| {
        ApiRequest::new(method, "demo").with_forwarded_for("203.0.113.9, 10.0.0.1")
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Create and read back
    // ─────────────────────────────────────────────────────────────────────────
    let created = gateway.handle(request("PUT").with_body("hello, vault")).await;
    println!("PUT  -> {} {}", created.status, created.text().trim_end());
    let udi = created.text().trim_start_matches("OK:").trim_end().to_string();

    let read = gateway.handle(request("GET").with_udi(udi.clone())).await;
    println!("GET  -> {} {:?}", read.status, read.text());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Overwrite
    // ─────────────────────────────────────────────────────────────────────────
    let updated = gateway
        .handle(request("POST").with_udi(udi.clone()).with_body("hello again"))
        .await;
    println!("POST -> {} {}", updated.status, updated.text().trim_end());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Exhaust the window (5 requests per minute for this address)
    // ─────────────────────────────────────────────────────────────────────────
    for _ in 0..3 {
        let response = gateway.handle(request("GET").with_udi(udi.clone())).await;
        println!("GET  -> {} ({})", response.status, response.text().trim_end());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Statistics
    // ─────────────────────────────────────────────────────────────────────────
    let stats = gateway.maintenance().stats().await?;
    println!("\n{stats}");

    Ok(())
}
