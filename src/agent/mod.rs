use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::HostByteAggregator;
use crate::config::Config;
use crate::flush::PeriodicFlusher;
use crate::follow::FileFollower;
use crate::migrate::{Migrator, PgMigrator};
use crate::store::{PgTrafficStore, TrafficStore};

/// Agent wires together the store, one follower task per log file, and the
/// periodic flusher.
pub struct Agent {
    cfg: Config,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Start all components. Any error here is startup-fatal; once this
    /// returns Ok the agent only stops on explicit shutdown.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Connect to the store.
        let store = PgTrafficStore::connect(&self.cfg.database)
            .await
            .context("connecting to traffic store")?;
        info!("connected to traffic store");

        // 2. Bring the schema up: versioned migrations if enabled, then the
        // always-on create-if-absent path.
        if self.cfg.database.migrations.enabled {
            let migrator = PgMigrator::new(store.pool().clone());
            migrator.up().await.context("applying migrations")?;
        }

        store
            .ensure_schema()
            .await
            .context("creating traffic schema")?;
        info!("traffic schema ready");

        // 3. Shared aggregator, one follower task per configured file.
        let aggregator = Arc::new(HostByteAggregator::new());
        let opts = self.cfg.logs.follower_options();

        for path in &self.cfg.logs.paths {
            let follower =
                FileFollower::new(path.clone(), opts.clone(), Arc::clone(&aggregator));
            self.tasks
                .push(tokio::spawn(follower.run(self.cancel.child_token())));
        }
        info!(files = self.cfg.logs.paths.len(), "followers started");

        // 4. Flush task.
        let flusher = PeriodicFlusher::new(
            Arc::clone(&aggregator),
            store,
            self.cfg.flush.interval,
        );
        self.tasks
            .push(tokio::spawn(flusher.run(self.cancel.child_token())));
        info!(interval = ?self.cfg.flush.interval, "flusher started");

        Ok(())
    }

    /// Gracefully stop all components. The flusher drains the aggregator one
    /// final time before its task exits.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "task join failed");
            }
        }

        Ok(())
    }
}
