//! Host assembly
//!
//! Wires configuration, the media library, discovered plugins, the job
//! manager and the scheduler together. The binary and the integration tests
//! both go through [`App`].

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_library::MediaLibrary;
use cadence_runtime::plugin::{self, PluginEntry};
use cadence_runtime::{
    InstallSummary, JobManager, JobOutcome, JobScheduler, Plugin, PluginContext, PluginRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::config::CadenceConfig;

pub struct App {
    config: CadenceConfig,
    library: Arc<MediaLibrary>,
    plugins: Vec<Box<dyn Plugin>>,
    entries: Vec<PluginEntry>,
    installed: InstallSummary,
    manager: Arc<JobManager>,
    scheduler: Arc<JobScheduler>,
}

impl App {
    /// Open the configured library and install every discovered plugin
    pub fn new(config: CadenceConfig) -> Result<Self> {
        let library = MediaLibrary::open(&config.library.db_path).with_context(|| {
            format!("Failed to open library at {}", config.library.db_path.display())
        })?;
        Ok(Self::with_library(config, Arc::new(library)))
    }

    /// Assemble around an already open library
    pub fn with_library(config: CadenceConfig, library: Arc<MediaLibrary>) -> Self {
        let registry = PluginRegistry::global();
        plugin::discover(registry);

        let plugins = registry.build_all();
        let entries = registry.entries();

        let ctx = plugin_context(&config, &library);
        let manager = JobManager::new_shared();
        let installed = plugin::install(&plugins, &ctx, &manager);

        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&manager),
            config.jobs.scheduler_config(),
        ));

        Self {
            config,
            library,
            plugins,
            entries,
            installed,
            manager,
            scheduler,
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn library(&self) -> &Arc<MediaLibrary> {
        &self.library
    }

    /// Built plugins, in registry order
    pub fn plugins(&self) -> &[Box<dyn Plugin>] {
        &self.plugins
    }

    /// Registry entries (identifier and order), in registry order
    pub fn plugin_entries(&self) -> &[PluginEntry] {
        &self.entries
    }

    pub fn installed(&self) -> &InstallSummary {
        &self.installed
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Installed job identifiers in plugin order, each listed once
    pub fn ordered_job_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.installed
            .jobs
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// Run jobs one after another, waiting for each
    ///
    /// Unknown identifiers yield `None`.
    pub async fn run_jobs(&self, job_ids: &[String]) -> Vec<(String, Option<JobOutcome>)> {
        let mut outcomes = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let outcome = self.manager.start_and_wait(job_id).await;
            if outcome.is_none() {
                tracing::warn!(job_id = %job_id, "Unknown job");
            }
            outcomes.push((job_id.clone(), outcome));
        }
        outcomes
    }

    /// Run the scheduler until `shutdown` fires, then stop every job
    pub async fn run_daemon(&self, shutdown: CancellationToken) -> Result<()> {
        self.scheduler.setup();

        if self.config.jobs.run_on_start {
            let started = self.scheduler.execute_pending_jobs();
            tracing::info!(started, "Started jobs on startup");
        }

        let trigger = self.scheduler.spawn_interval_trigger(shutdown.clone());
        if trigger.is_none() {
            tracing::info!("No scheduler interval configured, jobs only run on demand");
        }

        shutdown.cancelled().await;

        let stopped = self.manager.stop_all_jobs();
        tracing::info!(stopped, "Stopped running jobs");

        if let Some(trigger) = trigger {
            trigger.await.context("Scheduler trigger task failed")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("library", &self.library)
            .field("plugins", &self.entries)
            .field("jobs", &self.manager.job_ids())
            .finish()
    }
}

/// Resources and per-plugin settings handed to plugins
fn plugin_context(config: &CadenceConfig, library: &Arc<MediaLibrary>) -> PluginContext {
    let mut ctx = PluginContext::new()
        .with_resource(Arc::clone(library))
        .with_resource(Arc::new(config.jobs.batch_options()));

    for (plugin_id, settings) in &config.plugins {
        ctx = ctx.with_plugin_config(plugin_id.clone(), settings.clone());
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{covers, duplicates, hashes, prune};
    use cadence_runtime::BatchOptions;

    #[test]
    fn test_plugin_context_carries_options_and_settings() {
        let mut config = CadenceConfig::default();
        config.jobs.batch_size = 17;
        config
            .plugins
            .insert(covers::PLUGIN_ID.into(), serde_json::json!({ "enabled": false }));

        let library = Arc::new(MediaLibrary::open_in_memory().unwrap());
        let ctx = plugin_context(&config, &library);

        assert_eq!(ctx.resource::<BatchOptions>().unwrap().batch_size, 17);
        assert!(ctx.resource::<MediaLibrary>().is_some());
        assert!(!ctx.is_enabled(covers::PLUGIN_ID));
        assert!(ctx.is_enabled(hashes::PLUGIN_ID));
    }

    #[test]
    fn test_builtin_plugins_in_order() {
        let app = App::with_library(
            CadenceConfig::default(),
            Arc::new(MediaLibrary::open_in_memory().unwrap()),
        );

        let ids: Vec<&str> = app.plugins().iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![
                hashes::PLUGIN_ID,
                covers::PLUGIN_ID,
                duplicates::PLUGIN_ID,
                prune::PLUGIN_ID
            ]
        );
        assert_eq!(
            app.ordered_job_ids(),
            vec![
                hashes::JOB_ID,
                covers::JOB_ID,
                duplicates::JOB_ID,
                prune::JOB_ID
            ]
        );
        assert_eq!(
            app.manager().job_ids(),
            vec![
                hashes::JOB_ID,
                duplicates::JOB_ID,
                covers::JOB_ID,
                prune::JOB_ID
            ]
        );
    }
}
