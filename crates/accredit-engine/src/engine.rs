use std::sync::Arc;
use std::time::Duration;

use accredit_core::clock::{Clock, SystemClock};
use accredit_core::config::{AppConfig, SlaConfig};
use accredit_core::event::EventBus;
use accredit_core::traits::WorkflowStore;

use crate::batch::BatchEvaluator;
use crate::entry::EntryResolver;
use crate::fork::ForkCoordinator;
use crate::scheduler::SlaScheduler;
use crate::sla::SlaMonitor;
use crate::transition::TransitionEngine;

/// All engine components wired to one store, bus and clock.
pub struct WorkflowEngine {
    pub entry: EntryResolver,
    pub transitions: Arc<TransitionEngine>,
    pub forks: ForkCoordinator,
    pub batch: BatchEvaluator,
    pub sla: Arc<SlaMonitor>,
    store: Arc<dyn WorkflowStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    sla_config: SlaConfig,
}

impl WorkflowEngine {
    pub fn builder(store: Arc<dyn WorkflowStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A scheduler driving the SLA monitor at the configured interval.
    pub fn sla_scheduler(&self) -> SlaScheduler {
        self.sla_scheduler_every(Duration::from_secs(self.sla_config.interval_secs))
    }

    pub fn sla_scheduler_every(&self, interval: Duration) -> SlaScheduler {
        SlaScheduler::new(self.sla.clone(), interval, self.clock.clone())
    }
}

/// Builder for [`WorkflowEngine`]. Only the store is required.
pub struct EngineBuilder {
    store: Arc<dyn WorkflowStore>,
    event_bus: Option<Arc<EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    sla_config: SlaConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            event_bus: None,
            clock: None,
            sla_config: SlaConfig::default(),
        }
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sla_config(mut self, config: SlaConfig) -> Self {
        self.sla_config = config;
        self
    }

    /// Take the SLA settings and event bus capacity from a loaded config.
    pub fn config(mut self, config: &AppConfig) -> Self {
        self.sla_config = config.sla.clone();
        if self.event_bus.is_none() {
            self.event_bus = Some(Arc::new(EventBus::new(config.events.capacity)));
        }
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let event_bus = self.event_bus.unwrap_or_default();
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store;

        let transitions = Arc::new(TransitionEngine::new(
            store.clone(),
            event_bus.clone(),
            clock.clone(),
        ));
        let entry = EntryResolver::new(store.clone(), transitions.clone(), clock.clone());
        let forks = ForkCoordinator::new(
            store.clone(),
            transitions.clone(),
            event_bus.clone(),
            clock.clone(),
        );
        let batch = BatchEvaluator::new(store.clone());
        let sla = Arc::new(SlaMonitor::new(
            store.clone(),
            transitions.clone(),
            event_bus.clone(),
            clock.clone(),
            self.sla_config.breach_grace_minutes,
        ));

        WorkflowEngine {
            entry,
            transitions,
            forks,
            batch,
            sla,
            store,
            event_bus,
            clock,
            sla_config: self.sla_config,
        }
    }
}
