//! Plugin Orchestration
//!
//! Plugins are independently developed feature units. Each one is registered
//! as a lazy factory with an explicit `order`, discovered at startup through
//! link-time registrants, and built into an ordered list by the host.
//!
//! # Lifecycle
//!
//! 1. `discover` applies every `register_plugin!` registrant to a registry
//! 2. `PluginRegistry::build_all` invokes each factory once, in order
//! 3. `install` asks every plugin for its job contributions and registers
//!    them with the `JobManager`

mod discovery;
mod registry;

pub use discovery::*;
pub use registry::*;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobManager};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A feature unit contributing optional capabilities to the host
///
/// Every contribution has an empty default, so a plugin only implements
/// what it actually provides. The orchestration core never looks inside a
/// plugin beyond these hooks.
pub trait Plugin: Send + Sync + 'static {
    /// Stable plugin identifier (e.g. "library.hashes")
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str {
        self.id()
    }

    /// Background jobs this plugin contributes
    fn jobs(&self, _ctx: &PluginContext) -> Vec<Arc<dyn Job>> {
        Vec::new()
    }

    /// Settings section shown by the host's settings surface
    fn settings(&self) -> Option<SettingsSection> {
        None
    }
}

/// Describes the settings a plugin exposes to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSection {
    /// Section title
    pub title: String,

    /// Setting keys read from the plugin's configuration table
    #[serde(default)]
    pub keys: Vec<String>,
}

impl SettingsSection {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            keys: Vec::new(),
        }
    }

    /// Add a setting key
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Context
// ─────────────────────────────────────────────────────────────────────────────

type Resource = Arc<dyn Any + Send + Sync>;

/// Context handed to plugins when they build their contributions
///
/// Holds shared host resources looked up by type, and one configuration
/// value per plugin id.
#[derive(Clone, Default)]
pub struct PluginContext {
    resources: HashMap<TypeId, Resource>,
    config: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a shared resource
    pub fn with_resource<T: Any + Send + Sync>(mut self, resource: Arc<T>) -> Self {
        self.resources.insert(TypeId::of::<T>(), resource);
        self
    }

    /// Attach configuration for one plugin
    pub fn with_plugin_config(
        mut self,
        plugin_id: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        self.config.insert(plugin_id.into(), config);
        self
    }

    /// Look up a shared resource by type
    pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources
            .get(&TypeId::of::<T>())
            .and_then(|r| Arc::clone(r).downcast::<T>().ok())
    }

    /// Raw configuration for a plugin (`Null` if none was provided)
    pub fn plugin_config(&self, plugin_id: &str) -> &serde_json::Value {
        self.config
            .get(plugin_id)
            .unwrap_or(&serde_json::Value::Null)
    }

    /// Get a config value as a specific type
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, plugin_id: &str, key: &str) -> Option<T> {
        self.plugin_config(plugin_id)
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Plugins are enabled unless their config sets `enabled = false`
    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.get_config::<bool>(plugin_id, "enabled").unwrap_or(true)
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("resources", &self.resources.len())
            .field("configured", &self.config.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Installation
// ─────────────────────────────────────────────────────────────────────────────

/// Result of installing a plugin list into a job manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSummary {
    /// Installed plugin ids, in install order
    pub installed: Vec<String>,
    /// Plugins skipped because their config disabled them
    pub disabled: Vec<String>,
    /// Identifiers of the jobs registered
    pub jobs: Vec<String>,
}

/// Register the job contributions of every enabled plugin, in list order
///
/// Later plugins may replace a job registered by an earlier one by reusing
/// its identifier.
pub fn install(
    plugins: &[Box<dyn Plugin>],
    ctx: &PluginContext,
    manager: &JobManager,
) -> InstallSummary {
    let mut summary = InstallSummary::default();

    for plugin in plugins {
        let plugin_id = plugin.id();
        if !ctx.is_enabled(plugin_id) {
            tracing::info!(plugin = plugin_id, "Plugin disabled by configuration");
            summary.disabled.push(plugin_id.to_string());
            continue;
        }

        for job in plugin.jobs(ctx) {
            let job_id = job.spec().id;
            manager.register(job);
            summary.jobs.push(job_id);
        }

        tracing::debug!(plugin = plugin_id, name = plugin.name(), "Plugin installed");
        summary.installed.push(plugin_id.to_string());
    }

    tracing::info!(
        plugins = summary.installed.len(),
        jobs = summary.jobs.len(),
        "Plugins installed"
    );

    summary
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
