//! HTTP API handlers for the rules web UI.
//!
//! This module provides REST API endpoints for:
//! - Rule definitions and their actions

pub mod rules;

use axum::Router;

use crate::AppState;

/// Create the main API router with all endpoints mounted.
pub fn router() -> Router<AppState> {
    Router::new().nest("/rules", rules::router())
}
