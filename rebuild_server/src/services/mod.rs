//! Rebuild engine services.

pub mod aggregator;
pub mod dispatcher;
pub mod event_service;
pub mod executor;
pub mod planner;
pub mod policy;
pub mod publisher;
pub mod scheduler;
pub mod signature;

use std::sync::Arc;

use crate::clients::{BuildSystems, MetadataService};
use crate::config::RebuildConfig;
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::store::Store;

use aggregator::Aggregator;
use dispatcher::Dispatcher;
use event_service::EventService;
use planner::Planner;
use publisher::Publisher;
use scheduler::Scheduler;

/// The engine's components, wired to one store and one configuration.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<RebuildConfig>,
    pub events: EventService,
    pub planner: Planner,
    pub scheduler: Scheduler,
    pub aggregator: Aggregator,
    pub dispatcher: Dispatcher,
}

impl Services {
    pub fn new(
        config: Arc<RebuildConfig>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        metadata: Arc<dyn MetadataService>,
        build_systems: BuildSystems,
    ) -> Self {
        let events = EventService::new(store.clone(), publisher);
        let planner = Planner::new(store, metadata.clone(), config.clone());
        let scheduler = Scheduler::new(events.clone(), Arc::new(build_systems), config.clone());
        let aggregator = Aggregator::new(events.clone(), scheduler.clone(), config.clone());
        let ctx = HandlerContext {
            events: events.clone(),
            planner: planner.clone(),
            aggregator: aggregator.clone(),
            metadata,
        };
        let registry = Arc::new(HandlerRegistry::from_config(&config));
        let dispatcher = Dispatcher::new(registry, ctx, scheduler.clone(), config.clone());

        Self {
            config,
            events,
            planner,
            scheduler,
            aggregator,
            dispatcher,
        }
    }
}
