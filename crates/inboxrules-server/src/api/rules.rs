//! Rules API endpoints.
//!
//! Provides:
//! - GET /api/rules - List the caller's rules
//! - POST /api/rules - Create a rule with its conditions and actions
//! - GET /api/rules/:id - Get a rule by ID
//! - PATCH /api/rules/:id - Replace a rule's conditions and reconcile its actions
//! - PATCH /api/rules/:id/instructions - Update only the rule's instructions
//! - DELETE /api/rules/:id - Delete a rule
//!
//! The caller is identified by the `x-user-id` header.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use serde::{Deserialize, Serialize};

use inboxrules_core::{
    ActionSpec, Caller, Condition, NewRuleDefinition, Rule, RuleDefinitionUpdate, RuleError,
    RuleInstructionsUpdate,
};

use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Create the rules API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route(
            "/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/{id}/instructions", patch(update_rule_instructions))
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// A stored rule plus its conditions rebuilt as a tree, ready to be edited and
/// sent back in an update body.
#[derive(Debug, Serialize)]
struct RuleResponse {
    #[serde(flatten)]
    rule: Rule,
    conditions: Option<Condition>,
}

impl From<Rule> for RuleResponse {
    fn from(rule: Rule) -> Self {
        let conditions = rule.conditions();
        Self { rule, conditions }
    }
}

fn error_response(err: RuleError) -> Response {
    let (status, kind) = match &err {
        RuleError::NotAuthenticated => (StatusCode::UNAUTHORIZED, "unauthorized"),
        RuleError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        RuleError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        RuleError::DuplicateName | RuleError::DuplicateGroupBinding => {
            (StatusCode::CONFLICT, "conflict")
        }
        RuleError::PersistenceFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (status, Json(ApiError::new(kind, err.to_string()))).into_response()
}

fn caller_from(headers: &HeaderMap) -> Option<Caller> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user_id| !user_id.is_empty())
        .map(Caller::new)
}

/// GET /api/rules
async fn list_rules(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = caller_from(&headers);
    match state.rules.list_rules(caller.as_ref()).await {
        Ok(rules) => {
            let rules: Vec<RuleResponse> = rules.into_iter().map(RuleResponse::from).collect();
            (StatusCode::OK, Json(rules)).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /api/rules/:id
async fn get_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let caller = caller_from(&headers);
    match state.rules.get_rule(caller.as_ref(), &id).await {
        Ok(rule) => (StatusCode::OK, Json(RuleResponse::from(rule))).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/rules
///
/// Create a rule. Conditions are flattened onto the rule and every action is
/// created with it, in one transaction.
async fn create_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewRuleDefinition>,
) -> Response {
    let caller = caller_from(&headers);
    match state.rules.create_rule(caller.as_ref(), &body).await {
        Ok(rule) => (StatusCode::CREATED, Json(RuleResponse::from(rule))).into_response(),
        Err(e) => error_response(e),
    }
}

/// Request body for updating a rule. The rule id comes from the path.
///
/// `conditions` and `actions` replace the stored ones, so both must be sent;
/// `"conditions": null` clears the conditions.
#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub automate: Option<bool>,
    #[serde(default)]
    pub run_on_threads: Option<bool>,
    #[serde(deserialize_with = "Option::deserialize")]
    pub conditions: Option<Condition>,
    pub actions: Vec<ActionSpec>,
}

/// PATCH /api/rules/:id
///
/// Actions with an id are updated, actions without one are created and
/// stored actions missing from the body are deleted.
async fn update_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleRequest>,
) -> Response {
    let caller = caller_from(&headers);
    let update = RuleDefinitionUpdate {
        id,
        name: body.name,
        automate: body.automate,
        run_on_threads: body.run_on_threads,
        conditions: body.conditions,
        actions: body.actions,
    };

    match state.rules.update_rule(caller.as_ref(), &update).await {
        Ok(rule) => (StatusCode::OK, Json(RuleResponse::from(rule))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstructionsRequest {
    pub instructions: String,
}

/// PATCH /api/rules/:id/instructions
async fn update_rule_instructions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateInstructionsRequest>,
) -> Response {
    let caller = caller_from(&headers);
    let update = RuleInstructionsUpdate {
        id,
        instructions: body.instructions,
    };

    match state
        .rules
        .update_rule_instructions(caller.as_ref(), &update)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/rules/:id
async fn delete_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let caller = caller_from(&headers);
    match state.rules.delete_rule(caller.as_ref(), &id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
