//! In-memory engine wiring.
//!
//! ```text
//! submit ─▶ CommandDispatcher ─▶ InMemoryEventLog
//!                    │
//!                    └─▶ InMemoryEventBus ─▶ DeliveryPipeline ─┬─ library catalog
//!                                                              ├─ publisher directory
//!                                                              ├─ publisher catalog join
//!                                                              └─ book transfer saga ─▶ submit
//! ```
//!
//! Delivery runs either on a background [`ProjectionWorker`] or synchronously
//! through [`InMemoryEngine::settle`], which tests and the demo use.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use folio_core::AggregateId;
use folio_events::{EventEnvelope, InMemoryEventBus, Upcasters};
use folio_library::{Library, LibraryCommand, LibraryEvent};
use folio_publishing::{Publisher, PublisherCommand, PublisherEvent};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, SubmitOutcome};
use crate::config::EngineConfig;
use crate::event_store::{EventStoreError, InMemoryEventLog};
use crate::projections::{
    InMemoryCursorStore, LibraryCatalogProjection, LibraryRow, ProjectionEngine, PublisherCatalogJoin,
    PublisherDirectoryProjection, PublisherDocument, PublisherRow, ReplayError, rebuild,
};
use crate::read_model::InMemoryDocumentStore;
use crate::saga::{BookTransferSaga, SagaCoordinator};
use crate::snapshot::InMemorySnapshotStore;
use crate::workers::{DeliveryPipeline, PipelineHealth, ProjectionWorker, TickWorker, WorkerHandle};

pub type Envelope = EventEnvelope<JsonValue>;
pub type Log = Arc<InMemoryEventLog>;
pub type Bus = Arc<InMemoryEventBus<Envelope>>;
pub type Dispatcher = CommandDispatcher<Log, Arc<InMemorySnapshotStore>, Bus>;

pub type LibraryCatalog =
    ProjectionEngine<LibraryCatalogProjection, InMemoryDocumentStore<AggregateId, LibraryRow>, InMemoryCursorStore>;
pub type PublisherDirectory = ProjectionEngine<
    PublisherDirectoryProjection,
    InMemoryDocumentStore<AggregateId, PublisherRow>,
    InMemoryCursorStore,
>;
pub type PublisherCatalogView = PublisherCatalogJoin<InMemoryDocumentStore<AggregateId, PublisherDocument>>;

pub type TransferExecutor = Box<dyn Fn(LibraryCommand) -> Result<(), DispatchError> + Send + Sync>;
pub type TransferSaga = SagaCoordinator<BookTransferSaga, TransferExecutor>;

/// Registry of every upcaster the domain crates declare.
pub fn upcasters() -> Upcasters {
    let mut upcasters = Upcasters::new();
    folio_library::register_upcasters(&mut upcasters);
    upcasters
}

/// The whole engine over in-memory backends.
pub struct InMemoryEngine {
    config: EngineConfig,
    log: Log,
    bus: Bus,
    upcasters: Arc<Upcasters>,
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<LibraryCatalog>,
    directory: Arc<PublisherDirectory>,
    publisher_catalog: Arc<PublisherCatalogView>,
    transfers: Arc<TransferSaga>,
    pipeline: Arc<DeliveryPipeline<Log>>,
}

impl InMemoryEngine {
    pub fn new(config: EngineConfig) -> Self {
        let log: Log = Arc::new(InMemoryEventLog::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let upcasters = Arc::new(upcasters());

        let dispatcher = Arc::new(CommandDispatcher::new(
            log.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            bus.clone(),
            upcasters.clone(),
            &config,
        ));

        let catalog = Arc::new(ProjectionEngine::new(
            LibraryCatalogProjection,
            InMemoryDocumentStore::new(),
            InMemoryCursorStore::new(),
        ));
        let directory = Arc::new(ProjectionEngine::new(
            PublisherDirectoryProjection,
            InMemoryDocumentStore::new(),
            InMemoryCursorStore::new(),
        ));
        let publisher_catalog = Arc::new(PublisherCatalogJoin::new(InMemoryDocumentStore::new()));

        let saga_dispatcher = dispatcher.clone();
        let executor: TransferExecutor = Box::new(move |command: LibraryCommand| {
            saga_dispatcher.submit::<Library>(command).map(|_| ())
        });
        let transfers = Arc::new(SagaCoordinator::new(executor, config.saga_timeout));

        let pipeline = Arc::new(
            DeliveryPipeline::new(log.clone(), upcasters.clone(), &config)
                .register(catalog.clone())
                .register(directory.clone())
                .register(publisher_catalog.clone())
                .register(transfers.clone()),
        );

        Self {
            config,
            log,
            bus,
            upcasters,
            dispatcher,
            catalog,
            directory,
            publisher_catalog,
            transfers,
            pipeline,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn catalog(&self) -> &LibraryCatalog {
        &self.catalog
    }

    pub fn directory(&self) -> &PublisherDirectory {
        &self.directory
    }

    pub fn publisher_catalog(&self) -> &PublisherCatalogView {
        &self.publisher_catalog
    }

    pub fn transfers(&self) -> &TransferSaga {
        &self.transfers
    }

    pub fn pipeline(&self) -> &DeliveryPipeline<Log> {
        &self.pipeline
    }

    pub fn submit_library(
        &self,
        command: LibraryCommand,
    ) -> Result<SubmitOutcome<LibraryEvent>, DispatchError> {
        self.dispatcher.submit::<Library>(command)
    }

    pub fn submit_publisher(
        &self,
        command: PublisherCommand,
    ) -> Result<SubmitOutcome<PublisherEvent>, DispatchError> {
        self.dispatcher.submit::<Publisher>(command)
    }

    /// Deliver everything committed so far, including commands sagas issue
    /// along the way.
    pub fn settle(&self) -> Result<u64, EventStoreError> {
        self.pipeline.settle()
    }

    /// Evaluate saga deadlines, then deliver what the compensations committed.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize, EventStoreError> {
        let fired = self.transfers.tick(now);
        if fired > 0 {
            self.settle()?;
        }
        Ok(fired)
    }

    pub fn health(&self) -> PipelineHealth {
        self.pipeline.health()
    }

    /// Rebuild every read model and the saga instances from the log.
    ///
    /// Call with no worker running.
    pub fn rebuild_all(&self) -> Result<(), ReplayError> {
        let page_size = self.config.log_page_size;
        rebuild(&self.log, &self.upcasters, page_size, self.catalog.as_ref())?;
        rebuild(&self.log, &self.upcasters, page_size, self.directory.as_ref())?;
        rebuild(&self.log, &self.upcasters, page_size, self.publisher_catalog.as_ref())?;
        self.transfers.rebuild(&self.log, &self.upcasters, page_size)?;
        info!("read models rebuilt");
        Ok(())
    }

    /// Deliver from the bus on a background thread.
    pub fn spawn_worker(&self) -> WorkerHandle {
        ProjectionWorker::spawn("folio-delivery", self.bus.clone(), self.pipeline.clone())
    }

    /// Evaluate saga deadlines every `every` on a background thread.
    pub fn spawn_ticker(&self, every: Duration) -> WorkerHandle {
        let transfers = self.transfers.clone();
        TickWorker::spawn("folio-saga-ticker", every, move |now| {
            transfers.tick(now);
        })
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
