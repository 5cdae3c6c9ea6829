//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Health response from a running instance.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    components: BTreeMap<String, ComponentStatus>,
    #[serde(default)]
    circuit: Option<String>,
    #[serde(default)]
    pool: Option<PoolResponse>,
    #[serde(default)]
    queue_depth: u64,
    #[serde(default)]
    session: Option<SessionResponse>,
    #[serde(default)]
    session_phase: Option<String>,
    #[serde(default)]
    uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    idle: u64,
    active: u64,
    max: u64,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: i64,
    player_name: Option<String>,
    activity_type: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str, metrics_url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => {
                    print_health_status(&health, status_code.as_u16());
                }
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs a ticksink ingest running?");
            println!("Start one with: ticksink ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", metrics_url.trim_end_matches('/'));

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!("Uptime: {}s", health.uptime_secs);
    if let Some(circuit) = &health.circuit {
        println!("Circuit: {}", circuit);
    }
    if let Some(pool) = &health.pool {
        println!(
            "Pool: {} active, {} idle, {} max",
            pool.active, pool.idle, pool.max
        );
    }
    println!("Queue depth: {}", health.queue_depth);
    match &health.session {
        Some(session) => println!(
            "Session: {} ({}) player={} activity={}",
            session.id,
            health.session_phase.as_deref().unwrap_or("active"),
            session.player_name.as_deref().unwrap_or("-"),
            session.activity_type.as_deref().unwrap_or("-"),
        ),
        None => println!(
            "Session: none ({})",
            health.session_phase.as_deref().unwrap_or("unknown")
        ),
    }
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            if let Some(reason) = &status.reason {
                println!("  {} {}: {} ({})", tag, name, status.status, reason);
            } else {
                println!("  {} {}: {}", tag, name, status.status);
            }
        }
    }
}

/// Pull unlabelled samples out of Prometheus text.
fn parse_metrics(metrics_text: &str) -> BTreeMap<&str, f64> {
    let mut values = BTreeMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            if let Ok(value) = parts[1].parse::<f64>() {
                values.insert(parts[0], value);
            }
        }
    }
    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);

    let counters = [
        ("ticksink_records_submitted_total", "Records Submitted: "),
        ("ticksink_records_persisted_total", "Records Persisted: "),
        ("ticksink_component_rows_total", "Component Rows:    "),
        ("ticksink_records_requeued_total", "Records Requeued:  "),
        ("ticksink_batches_committed_total", "Batches Committed: "),
        ("ticksink_batches_rolled_back_total", "Batches Rolled Back: "),
    ];
    for (name, label) in counters {
        if let Some(v) = values.get(name) {
            println!("{}{}", label, format_number(*v as u64));
        }
    }
    if let Some(v) = values.get("ticksink_queue_depth") {
        println!("Queue Depth:       {}", *v as u64);
    }
    if let Some(v) = values.get("ticksink_store_call_avg_milliseconds") {
        println!("Avg Store Call:    {:.2} ms", v);
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
        assert_eq!(format_number(3_250_000_000), "3.25B");
    }

    #[test]
    fn test_parse_metrics_skips_comments() {
        let text = "# HELP ticksink_queue_depth Records waiting\n\
                    # TYPE ticksink_queue_depth gauge\n\
                    ticksink_queue_depth 12\n\
                    ticksink_store_call_avg_milliseconds 0.75\n\
                    ticksink_records_dropped{reason=\"queue_full\"} 3\n";
        let values = parse_metrics(text);
        assert_eq!(values.get("ticksink_queue_depth"), Some(&12.0));
        assert_eq!(values.get("ticksink_store_call_avg_milliseconds"), Some(&0.75));
        assert_eq!(
            values.get("ticksink_records_dropped{reason=\"queue_full\"}"),
            Some(&3.0)
        );
    }

    #[test]
    fn test_health_response_parses_engine_report() {
        let body = r#"{
            "status": "degraded",
            "healthy": true,
            "components": {
                "store": {"status": "degraded", "reason": "retrying"},
                "pool": {"status": "healthy"}
            },
            "circuit": "closed",
            "pool": {"open": 2, "idle": 1, "active": 1, "max": 10},
            "queue_depth": 4,
            "session": {"id": 9, "uuid": "00000000-0000-0000-0000-000000000000",
                        "player_name": null, "activity_type": "skilling",
                        "started_at": "2024-05-01T12:00:00Z"},
            "session_phase": "active",
            "uptime_secs": 30
        }"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.status, "degraded");
        assert_eq!(health.components["store"].reason.as_deref(), Some("retrying"));
        assert!(health.components["pool"].reason.is_none());
        assert_eq!(health.pool.unwrap().max, 10);
        assert_eq!(health.session.unwrap().id, 9);
        assert_eq!(health.queue_depth, 4);
    }
}
