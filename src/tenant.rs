use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{DEFAULT_STORE_TIMEOUT, Engine};
use crate::limits::*;
use crate::model::{DAY_MS, Ms};
use crate::notify::NotifyHub;
use crate::reaper;

pub const DEFAULT_TENANT: &str = "default";

/// Knobs applied to every tenant engine and its background tasks.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long terminal reservations are kept after their range ended.
    pub retention: Ms,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            sweep_interval: Duration::from_secs(60),
            retention: 30 * DAY_MS,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL file,
/// reaper and compactor. Tenant = `x-tenant-id` request header.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
    shutdown: CancellationToken,
}

/// Keep only `[A-Za-z0-9_-]` so the name is safe as a file name.
fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // The entry lock keeps two first requests from replaying the same log.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::with_timeout(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.settings.store_timeout,
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            self.settings.sweep_interval,
            self.settings.retention,
            self.shutdown.child_token(),
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
            self.shutdown.child_token(),
        ));

        info!("tenant {safe_name} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Stop every tenant's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
