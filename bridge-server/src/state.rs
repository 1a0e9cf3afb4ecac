use crate::adapters::credentials::TokenProvider;
use crate::config::AppConfig;
use crate::db::StateStore;
use crate::services::cycle::Engine;
use crate::services::sync_scheduler::CycleControl;
use crate::ws::events::EventBus;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub store: StateStore,
    pub engine: Engine,
    pub events: EventBus,
    pub control: Arc<CycleControl>,
    /// Present when the remote side is the cloud drive.
    pub tokens: Option<Arc<TokenProvider>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        engine: Engine,
        control: Arc<CycleControl>,
        tokens: Option<Arc<TokenProvider>>,
    ) -> Self {
        Self {
            config,
            store: engine.store.clone(),
            events: engine.events.clone(),
            engine,
            control,
            tokens,
        }
    }
}
