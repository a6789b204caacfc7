use meshvault_codec::{KdfParams, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

const ENV_PREFIX: &str = "MESHVAULT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Duplex,
}

impl FromStr for TransportKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "duplex" | "ws" | "websocket" => Ok(Self::Duplex),
            other => Err(CoreError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Every knob the coordinator reads. Durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub chunk_size: usize,
    pub replication_factor: usize,
    pub min_confirmations: usize,
    pub quorum_percent: f64,
    pub consensus_timeout_secs: f64,
    pub allow_pending: bool,
    pub probe_timeout_secs: f64,
    pub request_timeout_secs: f64,
    pub retries: u32,
    pub backoff_base_secs: f64,
    pub transport: TransportKind,
    pub probe_workers: usize,
    pub store_workers: usize,
    pub retrieve_workers: usize,
    pub ledger_path: PathBuf,
    pub kdf_iterations: u32,
    pub kdf_memory_kib: u32,
    pub listen: String,
    pub consensus_sweep_interval_secs: f64,
    /// Sent as the admin header on HTTP deletes.
    pub admin_token: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            replication_factor: 3,
            min_confirmations: 1,
            quorum_percent: 0.67,
            consensus_timeout_secs: 60.0,
            allow_pending: true,
            probe_timeout_secs: 2.0,
            request_timeout_secs: 30.0,
            retries: 2,
            backoff_base_secs: 0.5,
            transport: TransportKind::Http,
            probe_workers: 10,
            store_workers: 10,
            retrieve_workers: 10,
            ledger_path: PathBuf::from("data/ledger.json"),
            kdf_iterations: kdf.iterations,
            kdf_memory_kib: kdf.memory_kib,
            listen: "0.0.0.0:8080".to_string(),
            consensus_sweep_interval_secs: 30.0,
            admin_token: None,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults, overlaid by the JSON file when given, then by
    /// `MESHVAULT_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), CoreError> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        set_parsed(&mut self.chunk_size, "CHUNK_SIZE", get("CHUNK_SIZE"))?;
        set_parsed(&mut self.replication_factor, "REPLICATION_FACTOR", get("REPLICATION_FACTOR"))?;
        set_parsed(&mut self.min_confirmations, "MIN_CONFIRMATIONS", get("MIN_CONFIRMATIONS"))?;
        set_parsed(&mut self.quorum_percent, "QUORUM_PERCENT", get("QUORUM_PERCENT"))?;
        set_parsed(&mut self.consensus_timeout_secs, "CONSENSUS_TIMEOUT", get("CONSENSUS_TIMEOUT"))?;
        set_parsed(&mut self.allow_pending, "ALLOW_PENDING", get("ALLOW_PENDING"))?;
        set_parsed(&mut self.probe_timeout_secs, "PROBE_TIMEOUT", get("PROBE_TIMEOUT"))?;
        set_parsed(&mut self.request_timeout_secs, "REQUEST_TIMEOUT", get("REQUEST_TIMEOUT"))?;
        set_parsed(&mut self.retries, "RETRIES", get("RETRIES"))?;
        set_parsed(&mut self.backoff_base_secs, "BACKOFF_BASE", get("BACKOFF_BASE"))?;
        set_parsed(&mut self.transport, "TRANSPORT", get("TRANSPORT"))?;
        set_parsed(&mut self.probe_workers, "PROBE_WORKERS", get("PROBE_WORKERS"))?;
        set_parsed(&mut self.store_workers, "STORE_WORKERS", get("STORE_WORKERS"))?;
        set_parsed(&mut self.retrieve_workers, "RETRIEVE_WORKERS", get("RETRIEVE_WORKERS"))?;
        set_parsed(&mut self.kdf_iterations, "KDF_ITERATIONS", get("KDF_ITERATIONS"))?;
        set_parsed(&mut self.kdf_memory_kib, "KDF_MEMORY_KIB", get("KDF_MEMORY_KIB"))?;
        set_parsed(
            &mut self.consensus_sweep_interval_secs,
            "CONSENSUS_SWEEP_INTERVAL",
            get("CONSENSUS_SWEEP_INTERVAL"),
        )?;
        if let Some(path) = get("LEDGER_PATH") {
            self.ledger_path = PathBuf::from(path);
        }
        if let Some(listen) = get("LISTEN") {
            self.listen = listen;
        }
        if let Some(token) = get("ADMIN_TOKEN") {
            self.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let fail = |msg: &str| Err(CoreError::Config(msg.to_string()));
        if self.chunk_size == 0 {
            return fail("chunk_size must be greater than zero");
        }
        if self.replication_factor == 0 {
            return fail("replication_factor must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.quorum_percent) {
            return fail("quorum_percent must be within 0..=1");
        }
        for (name, secs) in [
            ("consensus_timeout", self.consensus_timeout_secs),
            ("probe_timeout", self.probe_timeout_secs),
            ("request_timeout", self.request_timeout_secs),
            ("consensus_sweep_interval", self.consensus_sweep_interval_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(CoreError::Config(format!("{name} must be a positive number of seconds")));
            }
        }
        if !(self.backoff_base_secs.is_finite() && self.backoff_base_secs >= 0.0) {
            return fail("backoff_base must not be negative");
        }
        if self.probe_workers == 0 || self.store_workers == 0 || self.retrieve_workers == 0 {
            return fail("worker pools need at least one worker");
        }
        Ok(())
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.consensus_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_secs)
    }

    pub fn consensus_sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.consensus_sweep_interval_secs)
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.kdf_iterations,
            memory_kib: self.kdf_memory_kib,
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, name: &str, raw: Option<String>) -> Result<(), CoreError>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = raw {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Config(format!("{ENV_PREFIX}{name}={raw}: {e}")))?;
    }
    Ok(())
}
