use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use infravisor_reconcile::ProcessStrategy;

use crate::lifecycle::WorkerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub reconcile_interval: Duration,
    pub detach_timeout: Duration,
    pub process_strategy: ProcessStrategy,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let listen_addr = var("INFRAVISOR_LISTEN_ADDR", "127.0.0.1:5000")
            .parse()
            .context("INFRAVISOR_LISTEN_ADDR is not a socket address")?;

        let log_level = var("INFRAVISOR_LOG_LEVEL", "info");

        let reconcile_interval = secs(&var("INFRAVISOR_RECONCILE_INTERVAL_SECS", "10"))
            .context("INFRAVISOR_RECONCILE_INTERVAL_SECS")?;
        if reconcile_interval.is_zero() {
            anyhow::bail!("INFRAVISOR_RECONCILE_INTERVAL_SECS must be greater than zero");
        }

        let detach_timeout = secs(&var("INFRAVISOR_DETACH_TIMEOUT_SECS", "60"))
            .context("INFRAVISOR_DETACH_TIMEOUT_SECS")?;

        let process_strategy = var("INFRAVISOR_PROCESS_STRATEGY", "sequential")
            .parse::<ProcessStrategy>()
            .map_err(anyhow::Error::msg)
            .context("INFRAVISOR_PROCESS_STRATEGY")?;

        let shutdown_timeout = secs(&var("INFRAVISOR_SHUTDOWN_TIMEOUT_SECS", "60"))
            .context("INFRAVISOR_SHUTDOWN_TIMEOUT_SECS")?;

        Ok(Self {
            listen_addr,
            log_level,
            reconcile_interval,
            detach_timeout,
            process_strategy,
            shutdown_timeout,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            interval: self.reconcile_interval,
            strategy: self.process_strategy,
            detach_timeout: self.detach_timeout,
        }
    }
}

fn secs(raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("'{raw}' is not a whole number of seconds"))?;
    Ok(Duration::from_secs(secs))
}
