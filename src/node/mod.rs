use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregation::GroupCatalog;
use crate::clock::{ProcessingClock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::dimension::{DimensionCatalog, DimensionStore};
use crate::engine::scheduler::Schedule;
use crate::engine::{AggregationEngine, EngineSettings, EngineStores, Scheduler};
use crate::export::HealthMetrics;
use crate::lock::memory::{InMemoryEntityLockStore, InMemoryMutexStore};
use crate::lock::{ClusterLockService, EntityLockStore, MutexStore};
use crate::store::memory::MemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::RawEventStore;

/// Every store a node talks to, all backed by one implementation.
#[derive(Clone)]
pub struct Backends {
    pub mutexes: Arc<dyn MutexStore>,
    pub entity_locks: Arc<dyn EntityLockStore>,
    pub dimensions: Arc<dyn DimensionStore>,
    pub engine: EngineStores,
}

impl Backends {
    /// Opens the configured backend.
    pub fn open(cfg: &Config, clock: Arc<dyn ProcessingClock>) -> Result<Self> {
        match cfg.store.backend {
            StoreBackend::Sqlite => {
                let store = Arc::new(SqliteStore::open(&cfg.store, clock)?);
                info!(path = %cfg.store.path.display(), "opened sqlite store");
                Ok(Self {
                    mutexes: store.clone(),
                    entity_locks: store.clone(),
                    dimensions: store.clone(),
                    engine: EngineStores {
                        events: store.clone(),
                        aggregations: store.clone(),
                        sessions: store,
                    },
                })
            }
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                info!("using in-memory store, state is lost on exit");
                Ok(Self {
                    mutexes: Arc::new(InMemoryMutexStore::new(clock.clone())),
                    entity_locks: Arc::new(InMemoryEntityLockStore::new(clock)),
                    dimensions: store.clone(),
                    engine: EngineStores {
                        events: store.clone(),
                        aggregations: store.clone(),
                        sessions: store,
                    },
                })
            }
        }
    }
}

/// Node wires stores, the aggregation engine, the scheduler and the health
/// server together.
pub struct Node {
    cfg: Config,
    health: Arc<HealthMetrics>,
    backends: Backends,
    engine: Arc<AggregationEngine>,
    cancel: CancellationToken,
    jobs: Vec<JoinHandle<()>>,
}

impl Node {
    /// Opens the store and builds the engine. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(cfg: Config) -> Result<Self> {
        let clock: Arc<dyn ProcessingClock> = Arc::new(SystemClock);
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let backends = Backends::open(&cfg, clock.clone()).context("opening store")?;

        let identity = cfg.identity();
        info!(server_id = %identity, "node identity");

        let locks = Arc::new(ClusterLockService::new(
            backends.mutexes.clone(),
            identity,
            cfg.lock_config(),
        ));
        let dimensions = Arc::new(
            DimensionCatalog::new(
                backends.dimensions.clone(),
                Arc::new(cfg.calendar()),
                cfg.dimensions.horizon_start,
            )
            .with_max_extension(cfg.max_extension()),
        );
        let groups = Arc::new(GroupCatalog::new(cfg.aggregation.groups.iter().cloned()));

        let engine = Arc::new(
            AggregationEngine::new(
                locks,
                dimensions,
                groups,
                backends.engine.clone(),
                clock,
                EngineSettings::from_config(&cfg),
            )
            .with_metrics(health.clone()),
        );

        Ok(Self {
            cfg,
            health,
            backends,
            engine,
            cancel: CancellationToken::new(),
            jobs: Vec::new(),
        })
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<dyn RawEventStore> {
        &self.backends.engine.events
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Starts the health server and the job loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let scheduler = Scheduler::new(
            Arc::clone(&self.engine),
            Schedule {
                aggregation: self.cfg.aggregation.interval,
                dimension_population: self.cfg.dimensions.interval,
                purge: self.cfg.purge.interval,
            },
            self.cancel.child_token(),
        );
        self.jobs = scheduler.spawn();

        info!("node started");
        Ok(())
    }

    /// Stops the job loops, waiting for in-flight jobs, then the health
    /// server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for job in self.jobs.drain(..) {
            job.await.context("joining job loop")?;
        }

        self.health.stop().await?;

        info!("node stopped");
        Ok(())
    }
}
