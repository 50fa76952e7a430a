//! Validate a configuration file.

use anyhow::{Context, Result};
use std::path::Path;
use tidal_sync_client::Config;

/// Run the check-config command.
pub fn run(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let problems = validate(&config);
    if !problems.is_empty() {
        anyhow::bail!(
            "{} has {} problem(s):\n  - {}",
            path.display(),
            problems.len(),
            problems.join("\n  - ")
        );
    }

    let rendered =
        serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{} is valid. Effective configuration:", path.display());
    println!("{rendered}");

    Ok(config)
}

/// Values that parse but would make the runtime misbehave.
fn validate(config: &Config) -> Vec<String> {
    let mut problems = Vec::new();
    let realtime = &config.realtime;

    for (name, value) in [
        ("connection_timeout_ms", realtime.connection_timeout_ms),
        ("base_delay_ms", realtime.base_delay_ms),
        ("heartbeat_interval_ms", realtime.heartbeat_interval_ms),
        ("idle_sweep_interval_ms", realtime.idle_sweep_interval_ms),
        ("poll_interval_ms", realtime.poll_interval_ms),
    ] {
        if value == 0 {
            problems.push(format!("realtime.{name} must be greater than zero"));
        }
    }
    if realtime.base_delay_ms > realtime.max_delay_ms {
        problems.push(format!(
            "realtime.base_delay_ms ({}) exceeds realtime.max_delay_ms ({})",
            realtime.base_delay_ms, realtime.max_delay_ms
        ));
    }

    let mut namespaces: Vec<_> = config.cache.iter().collect();
    namespaces.sort_by(|a, b| a.0.cmp(b.0));
    for (namespace, policy) in namespaces {
        if policy.max_entries == 0 {
            problems.push(format!("cache.{namespace}.max_entries must be at least 1"));
        }
        let threshold = policy.location_threshold_meters;
        if policy.location_based && (threshold.is_nan() || threshold <= 0.0) {
            problems.push(format!(
                "cache.{namespace}.location_threshold_meters must be positive for location-based policies"
            ));
        }
    }

    problems
}
