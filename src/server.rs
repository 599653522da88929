use std::sync::Arc;

use axum::{middleware, Router};

use crate::api;
use crate::auth::middleware::auth_middleware;
use crate::config::Config;
use crate::storage::filesystem::FilesystemStore;
use crate::storage::multipart::MultipartManager;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<FilesystemStore>,
    pub uploads: Arc<MultipartManager>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    api::s3_router()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::read_only_guard,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}
