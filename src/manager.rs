//! The admission controller: registry, capacity limits, LRU eviction, and
//! the on-demand start path that coalesces concurrent proxy requests onto
//! one in-flight start.
//!
//! Concurrency shape is a concurrent map of per-instance state plus a
//! single owning manager; capacity enforcement generalizes "stop something
//! to make room for a new start" into LRU-by-`last_activity` eviction
//! across named instances.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{EngineConfig, InstanceOptions};
use crate::db::Db;
use crate::error::Error;
use crate::instance::{Instance, InstanceSnapshot, InstanceStatus};
use crate::ports::PortAllocator;

pub struct Manager {
    instances: DashMap<String, Arc<Instance>>,
    config: Arc<EngineConfig>,
    ports: Arc<PortAllocator>,
    db: Arc<Db>,
    admission: AsyncMutex<()>,
}

impl Manager {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, Error> {
        let db = Arc::new(Db::open(&config.db_path)?);
        let ports = Arc::new(PortAllocator::new(config.port_range_low, config.port_range_high));
        Ok(Arc::new(Self {
            instances: DashMap::new(),
            config: Arc::new(config),
            ports,
            db,
            admission: AsyncMutex::new(()),
        }))
    }

    /// Startup recovery (§6.2): reloads every persisted instance and
    /// re-enqueues a start for any row whose last committed status was
    /// `running`.
    pub async fn recover(self: &Arc<Self>) -> Result<(), Error> {
        for row in self.db.list_instances()? {
            let was_running = row.status == InstanceStatus::Running;
            let instance = Instance::new(
                row.name.clone(),
                row.options,
                InstanceStatus::Stopped,
                Arc::clone(&self.config),
                Arc::clone(&self.ports),
                Arc::clone(&self.db),
            );
            self.instances.insert(row.name.clone(), Arc::clone(&instance));
            if was_running {
                info!(instance = %row.name, "re-enqueuing start after recovery");
                let manager = Arc::clone(self);
                let name = row.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.start_instance(&name).await {
                        warn!(instance = %name, error = %e, "recovery start failed");
                    }
                });
            }
        }
        Ok(())
    }

    pub fn create_instance(&self, name: &str, options: InstanceOptions) -> Result<(), Error> {
        options.validate(name)?;
        if self.instances.contains_key(name) {
            return Err(Error::AlreadyExists { name: name.to_string() });
        }
        if self.instances.len() >= self.config.max_instances {
            return Err(Error::MaxInstances {
                limit: self.config.max_instances,
            });
        }
        self.db.create_instance(name, &options, InstanceStatus::Stopped)?;
        let instance = Instance::new(
            name.to_string(),
            options,
            InstanceStatus::Stopped,
            Arc::clone(&self.config),
            Arc::clone(&self.ports),
            Arc::clone(&self.db),
        );
        self.instances.insert(name.to_string(), instance);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots: Vec<_> = self.instances.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Updates an instance's options from a partial patch (§6.1: `PUT
    /// /instances/{name}` takes `Options (partial)`): fields present in
    /// `patch` overwrite the instance's current options, fields absent from
    /// it are left untouched rather than reset to their defaults. If the
    /// instance is currently running, triggers an internal restart so the
    /// new options take effect (§4.1).
    pub async fn update_options(
        self: &Arc<Self>,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        let instance = self
            .instances
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::NotFound { name: name.to_string() })?;

        let options = merge_options_patch(&instance.options(), patch)?;
        options.validate(name)?;
        self.db.update_options(name, &options)?;
        let was_running = instance.status() == InstanceStatus::Running;
        instance.update_options(options);
        if was_running {
            self.restart_instance(name).await?;
        }
        Ok(())
    }

    /// Deletes a stopped instance. Callers must stop a running instance
    /// first (§4.1); delete never implicitly stops one.
    pub async fn delete_instance(&self, name: &str) -> Result<(), Error> {
        let instance = self
            .instances
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::NotFound { name: name.to_string() })?;
        if instance.status() != InstanceStatus::Stopped {
            return Err(Error::Conflict { name: name.to_string() });
        }
        self.instances.remove(name);
        self.db.delete_instance(name)?;
        Ok(())
    }

    fn running_count(&self, excluding: &str) -> usize {
        self.instances
            .iter()
            .filter(|e| e.key() != excluding)
            .filter(|e| {
                matches!(
                    e.value().status(),
                    InstanceStatus::Running | InstanceStatus::Starting | InstanceStatus::Restarting
                )
            })
            .count()
    }

    /// Picks the least-recently-used evictable instance: running,
    /// `on_demand_start = true`, not the target itself, oldest
    /// `last_activity` first, ties broken by lexicographically smallest
    /// name (§4.1).
    fn pick_eviction_victim(&self, excluding: &str) -> Option<Arc<Instance>> {
        let mut candidates: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .filter(|e| e.key() != excluding)
            .map(|e| Arc::clone(e.value()))
            .filter(|inst| inst.status() == InstanceStatus::Running && inst.options().on_demand_start)
            .collect();
        candidates.sort_by(|a, b| {
            a.last_activity()
                .cmp(&b.last_activity())
                .then_with(|| a.name().cmp(b.name()))
        });
        candidates.into_iter().next()
    }

    /// Admits a start: enforces `max_running_instances`, evicting the LRU
    /// idle instance if eviction is enabled and room is needed, then spawns
    /// the subprocess. Does not wait for readiness — see `ensure_running`.
    pub async fn start_instance(self: &Arc<Self>, name: &str) -> Result<(), Error> {
        let instance = self
            .get(name)
            .ok_or_else(|| Error::NotFound { name: name.to_string() })?;

        let _admission = self.admission.lock().await;
        match instance.status() {
            InstanceStatus::Running | InstanceStatus::Starting => return Ok(()),
            _ => {}
        }

        if self.running_count(name) >= self.config.max_running_instances {
            if self.config.enable_lru_eviction {
                match self.pick_eviction_victim(name) {
                    Some(victim) => {
                        info!(evicted = %victim.name(), for_instance = %name, "evicting idle instance to admit start");
                        victim
                            .stop(Duration::from_secs(self.config.graceful_stop_secs))
                            .await?;
                    }
                    None => {
                        return Err(Error::MaxRunning {
                            limit: self.config.max_running_instances,
                        })
                    }
                }
            } else {
                return Err(Error::MaxRunning {
                    limit: self.config.max_running_instances,
                });
            }
        }

        instance.start().await
    }

    /// The on-demand start path the reverse proxy calls: starts the
    /// instance if necessary (coalescing concurrent callers onto the same
    /// in-flight start via `Instance::wait_ready`) and returns its port
    /// once ready.
    pub async fn ensure_running(self: &Arc<Self>, name: &str) -> Result<u16, Error> {
        let instance = self
            .get(name)
            .ok_or_else(|| Error::NotFound { name: name.to_string() })?;

        match instance.status() {
            InstanceStatus::Running => {}
            InstanceStatus::Starting | InstanceStatus::Restarting => {
                instance
                    .wait_ready(Duration::from_secs(self.config.on_demand_start_timeout_secs))
                    .await?;
            }
            InstanceStatus::ShuttingDown => {
                return Err(Error::UpstreamUnavailable { name: name.to_string() });
            }
            InstanceStatus::Stopped | InstanceStatus::Failed => {
                if !instance.options().on_demand_start {
                    return Err(Error::NotRunning { name: name.to_string() });
                }
                self.start_instance(name).await?;
                instance
                    .wait_ready(Duration::from_secs(self.config.on_demand_start_timeout_secs))
                    .await?;
            }
        }

        instance
            .snapshot()
            .port
            .ok_or_else(|| Error::UpstreamUnavailable { name: name.to_string() })
    }

    pub async fn stop_instance(&self, name: &str) -> Result<(), Error> {
        let instance = self
            .get(name)
            .ok_or_else(|| Error::NotFound { name: name.to_string() })?;
        instance
            .stop(Duration::from_secs(self.config.graceful_stop_secs))
            .await
    }

    pub async fn restart_instance(self: &Arc<Self>, name: &str) -> Result<(), Error> {
        self.stop_instance(name).await?;
        self.start_instance(name).await
    }

    /// One sweep of the idle-timeout reaper (§4.6): stops any running
    /// instance whose idle duration has exceeded its configured timeout.
    pub async fn reap_idle(&self) {
        let now = now_epoch();
        let idle: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .map(|e| Arc::clone(e.value()))
            .filter(|inst| {
                let opts = inst.options();
                if opts.idle_timeout_minutes == 0 || inst.status() != InstanceStatus::Running {
                    return false;
                }
                now - inst.last_activity() >= (opts.idle_timeout_minutes * 60) as i64
            })
            .collect();
        for instance in idle {
            info!(instance = %instance.name(), "idle timeout reached, stopping");
            if let Err(e) = instance
                .stop(Duration::from_secs(self.config.graceful_stop_secs))
                .await
            {
                warn!(instance = %instance.name(), error = %e, "idle stop failed");
            }
        }
    }

    pub fn instance_names(&self) -> BTreeSet<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    /// Stops every instance within the graceful shutdown budget, in
    /// parallel. Used by `main.rs` on receipt of a termination signal.
    pub async fn shutdown_all(&self) {
        let instances: Vec<Arc<Instance>> = self.instances.iter().map(|e| Arc::clone(e.value())).collect();
        let grace = Duration::from_secs(self.config.graceful_stop_secs);
        let mut set = tokio::task::JoinSet::new();
        for inst in instances {
            set.spawn(async move { inst.stop(grace).await });
        }
        while set.join_next().await.is_some() {}
    }
}

/// Applies a partial JSON patch onto `current` field-by-field: keys present
/// in `patch` overwrite the corresponding field, keys it omits keep
/// `current`'s value. `patch` must be a JSON object.
fn merge_options_patch(current: &InstanceOptions, patch: serde_json::Value) -> Result<InstanceOptions, Error> {
    let serde_json::Value::Object(patch) = patch else {
        return Err(Error::ValidationError {
            message: "request body must be a JSON object".into(),
        });
    };
    let mut merged = serde_json::to_value(current).map_err(|e| Error::ValidationError {
        message: format!("failed to encode current options: {e}"),
    })?;
    let serde_json::Value::Object(merged_map) = &mut merged else {
        unreachable!("InstanceOptions always serializes to a JSON object");
    };
    for (key, value) in patch {
        merged_map.insert(key, value);
    }
    serde_json::from_value(merged).map_err(|e| Error::ValidationError {
        message: format!("invalid options patch: {e}"),
    })
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
