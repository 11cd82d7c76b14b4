//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::{Config, ConfigError};
use deal_desk_core::{
    lifecycle::DealLifecycleEngine,
    pipeline::IngestionPipeline,
    ports::{AnalysisQueue, DatabaseService, NotificationService},
    settings::SettingsHandle,
};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub settings: SettingsHandle,
    pub engine: Arc<DealLifecycleEngine>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl AppState {
    /// Wires the core services over the given adapters.
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn DatabaseService>,
        queue: Arc<dyn AnalysisQueue>,
        notifier: Arc<dyn NotificationService>,
    ) -> Result<Self, ConfigError> {
        let settings = SettingsHandle::new(config.pipeline_settings()?);
        let engine = Arc::new(DealLifecycleEngine::new(
            db.clone(),
            queue,
            notifier,
            settings.clone(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            db.clone(),
            settings.clone(),
            engine.clone(),
        ));
        Ok(Self {
            db,
            config,
            settings,
            engine,
            pipeline,
        })
    }
}
