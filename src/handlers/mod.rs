use crate::services::{object_store::SharedStore, pipeline::Pipeline};
use std::sync::Arc;

pub mod health_handlers;
pub mod object_handlers;
pub mod trigger_handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline: Arc::new(pipeline),
        }
    }
}
