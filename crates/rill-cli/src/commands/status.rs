//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    uptime_seconds: u64,
    components: BTreeMap<String, ComponentStatus>,
    #[serde(default)]
    streams: Vec<StreamStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamStatus {
    id: String,
    state: StreamState,
    progress: StreamProgress,
}

#[derive(Debug, Deserialize)]
struct StreamState {
    state: String,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamProgress {
    batch_id: Option<u64>,
    committed_offset: u64,
    batches_committed: u64,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let base = url.trim_end_matches('/');
    let client = reqwest::Client::new();

    match client.get(format!("{}/health", base)).send().await {
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
            println!("\nIs rill running?");
            println!("Start it with: rill run --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", base);
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
        "{} Overall Status: {} (HTTP {}, up {}s)",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code,
        health.uptime_seconds
    );
    println!();

    if !health.streams.is_empty() {
        println!("Streams:");
        for stream in &health.streams {
            let batch = stream
                .progress
                .batch_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            println!(
                "  {}: {} (committed offset {}, last batch {}, {} batches this run)",
                stream.id,
                stream.state.state,
                stream.progress.committed_offset,
                batch,
                stream.progress.batches_committed
            );
            if let Some(error) = &stream.state.error {
                println!("    error: {}", error);
            }
        }
        println!();
    }

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

/// Sum of each metric across label sets, keyed by metric name.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, u64> {
    let mut values: HashMap<&str, u64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        // "name{labels} value" or "name value"
        let Some((series, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let name = series.split('{').next().unwrap_or(series);
        if let Ok(value) = value.parse::<u64>() {
            *values.entry(name).or_insert(0) += value;
        }
    }

    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);

    let rows = [
        ("rill_records_polled_total", "Records Polled:    "),
        ("rill_batches_committed_total", "Batches Committed: "),
        ("rill_rows_written_total", "Rows Written:      "),
        ("rill_files_published_total", "Files Published:   "),
        ("rill_decode_failures_total", "Decode Failures:   "),
        ("rill_sink_failures_total", "Sink Failures:     "),
        ("rill_poll_errors_total", "Poll Errors:       "),
    ];
    for (metric, label) in rows {
        if let Some(v) = values.get(metric) {
            println!("{}{}", label, format_number(*v));
        }
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
    fn test_parse_metrics_sums_labels() {
        let text = "# HELP rill_records_polled_total x\n\
                    # TYPE rill_records_polled_total counter\n\
                    rill_records_polled_total{stream=\"a\"} 3\n\
                    rill_records_polled_total{stream=\"b\"} 4\n\
                    rill_batch_duration_seconds_sum{stream=\"a\"} 0.25\n";
        let values = parse_metrics(text);
        assert_eq!(values.get("rill_records_polled_total"), Some(&7));
        assert!(!values.contains_key("rill_batch_duration_seconds_sum"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }

    #[test]
    fn test_health_response_parses() {
        let json = serde_json::json!({
            "status": "degraded",
            "uptime_seconds": 12,
            "running_streams": ["weather"],
            "components": {
                "weather:source": {"status": "degraded", "reason": "Poll failed"},
                "weather:checkpoint": {"status": "healthy"}
            },
            "streams": [{
                "id": "weather",
                "state": {"state": "idle"},
                "progress": {"stream_id": "weather", "batch_id": 3, "committed_offset": 40, "batches_committed": 4}
            }]
        });
        let health: HealthResponse = serde_json::from_value(json).unwrap();
        assert_eq!(health.streams[0].progress.committed_offset, 40);
        assert_eq!(
            health.components["weather:source"].reason.as_deref(),
            Some("Poll failed")
        );
        assert!(health.streams[0].state.error.is_none());
    }
}
