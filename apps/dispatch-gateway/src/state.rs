//! Shared application state handed to every Axum handler.

use std::sync::Arc;

use dispatch_engine::JobDispatchEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobDispatchEngine>,
}

impl AppState {
    pub fn new(engine: Arc<JobDispatchEngine>) -> Self {
        Self { engine }
    }
}
