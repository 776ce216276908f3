use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, patch, post};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::app::dispatcher::AttemptDispatcher;
use crate::app::error::{ApiError, ApiResult};
use crate::app::model::StartCurationRequest;
use crate::app::review::{BlockerPatch, NewBlocker, NewRow, ReviewService, RowPatch};
use crate::app::runner::{SearchFactory, create_attempt};
use crate::app::store::CurationStore;
use crate::config::CurationConfig;
use crate::formats::QaDecision;
use crate::validation::Validator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CurationStore>,
    pub review: Arc<ReviewService>,
    /// Where public run requests go (in-process queue or remote worker).
    pub dispatcher: Arc<dyn AttemptDispatcher>,
    /// Runs attempts on this process; target of the internal worker route.
    pub local: Arc<dyn AttemptDispatcher>,
    pub search: Arc<dyn SearchFactory>,
    pub config: CurationConfig,
    pub worker_token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/attempts", post(create))
        .route("/attempts/:attempt_id", get(view))
        .route("/attempts/:attempt_id/run", post(run))
        .route("/internal/attempts/:attempt_id/run", post(internal_run))
        .route("/attempts/:attempt_id/gaps", get(gaps))
        .route("/attempts/:attempt_id/dod", get(dod))
        .route("/attempts/:attempt_id/attempt2", get(attempt2))
        .route("/attempts/:attempt_id/review", post(begin_review))
        .route("/attempts/:attempt_id/rows", post(add_row))
        .route("/attempts/:attempt_id/rows/:row_id", patch(update_row))
        .route("/attempts/:attempt_id/bulk-accept", post(bulk_accept))
        .route("/attempts/:attempt_id/notes", post(add_note))
        .route("/attempts/:attempt_id/blockers", post(add_blocker))
        .route(
            "/attempts/:attempt_id/blockers/:blocker_id",
            patch(update_blocker),
        )
        .route("/attempts/:attempt_id/submit-qa", post(submit_qa))
        .route("/attempts/:attempt_id/qa-decision", post(qa_decision))
        .route("/attempts/:attempt_id/second-attempt", post(second_attempt))
        .route("/attempts/:attempt_id/escalate", post(escalate))
        .route("/attempts/:attempt_id/restart", post(restart))
        .route("/attempts/:attempt_id/validate", post(validate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn create(
    State(state): State<AppState>,
    Json(request): Json<StartCurationRequest>,
) -> ApiResult<impl IntoResponse> {
    request
        .validate()
        .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?;
    let attempt = create_attempt(state.store.as_ref(), &request).await?;
    tracing::info!(
        attempt_id = %attempt.attempt_id,
        course_id = %attempt.course_id,
        autostart = request.autostart,
        "attempt created"
    );
    if request.autostart {
        dispatch(state.dispatcher.as_ref(), &attempt.attempt_id).await?;
    }
    Ok((StatusCode::CREATED, Json(attempt)))
}

async fn view(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.view(&attempt_id).await?))
}

async fn run(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_exists(&state, &attempt_id).await?;
    dispatch(state.dispatcher.as_ref(), &attempt_id).await?;
    Ok(accepted(&attempt_id))
}

async fn internal_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let Some(expected) = state.worker_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented != Some(expected) {
        return Err(ApiError::Unauthorized);
    }
    ensure_exists(&state, &attempt_id).await?;
    dispatch(state.local.as_ref(), &attempt_id).await?;
    Ok(accepted(&attempt_id))
}

async fn gaps(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.gaps(&attempt_id).await?))
}

async fn dod(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.dod(&attempt_id).await?))
}

async fn attempt2(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.attempt2(&attempt_id).await?))
}

async fn begin_review(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.begin_review(&attempt_id).await?))
}

async fn add_row(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    Json(new_row): Json<NewRow>,
) -> ApiResult<impl IntoResponse> {
    let row = state.review.add_manual_row(&attempt_id, new_row).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn update_row(
    State(state): State<AppState>,
    Path((attempt_id, row_id)): Path<(String, String)>,
    Json(patch): Json<RowPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.review.update_row(&attempt_id, &row_id, patch).await?,
    ))
}

async fn bulk_accept(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let accepted = state.review.bulk_accept(&attempt_id).await?;
    Ok(Json(json!({ "accepted_row_ids": accepted })))
}

#[derive(Debug, Deserialize)]
struct NoteBody {
    message: String,
}

async fn add_note(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    Json(body): Json<NoteBody>,
) -> ApiResult<impl IntoResponse> {
    let entry = state.review.add_note(&attempt_id, &body.message).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn add_blocker(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    Json(new_blocker): Json<NewBlocker>,
) -> ApiResult<impl IntoResponse> {
    let blocker = state.review.add_blocker(&attempt_id, new_blocker).await?;
    Ok((StatusCode::CREATED, Json(blocker)))
}

async fn update_blocker(
    State(state): State<AppState>,
    Path((attempt_id, blocker_id)): Path<(String, String)>,
    Json(patch): Json<BlockerPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .review
            .update_blocker(&attempt_id, &blocker_id, patch)
            .await?,
    ))
}

async fn submit_qa(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.submit_to_qa(&attempt_id).await?))
}

#[derive(Debug, Deserialize)]
struct QaDecisionBody {
    decision: QaDecision,
}

async fn qa_decision(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    Json(body): Json<QaDecisionBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .review
            .apply_qa_decision(&attempt_id, body.decision)
            .await?,
    ))
}

async fn second_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let Some(previous) = state.store.get(&attempt_id).await? else {
        return Err(ApiError::NotFound(format!("attempt not found: {attempt_id}")));
    };
    let attempt = state.review.start_second_attempt(&attempt_id).await?;
    if let Err(err) = dispatch(state.dispatcher.as_ref(), &attempt_id).await {
        state.review.cancel_second_attempt(&previous).await?;
        return Err(err);
    }
    Ok((StatusCode::ACCEPTED, Json(attempt)))
}

async fn escalate(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.escalate(&attempt_id).await?))
}

async fn restart(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.restart(&attempt_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValidateBody {
    owner_id: Option<String>,
}

async fn validate(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    body: Option<Json<ValidateBody>>,
) -> ApiResult<impl IntoResponse> {
    let Some(request) = state.store.get_request(&attempt_id).await? else {
        return Err(ApiError::NotFound(format!("attempt not found: {attempt_id}")));
    };
    let owner_id = body
        .and_then(|Json(b)| b.owner_id)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let search = state.search.build(request.engine)?;
    let validator = Validator::new(Arc::clone(&state.store), search, state.config.clone());
    let outcome = validator
        .run(&attempt_id, &owner_id)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(outcome))
}

async fn ensure_exists(state: &AppState, attempt_id: &str) -> ApiResult<()> {
    if state.store.exists(attempt_id).await? {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("attempt not found: {attempt_id}")))
    }
}

async fn dispatch(dispatcher: &dyn AttemptDispatcher, attempt_id: &str) -> ApiResult<()> {
    dispatcher
        .dispatch(attempt_id)
        .await
        .map_err(|err| ApiError::Unavailable(format!("attempt {attempt_id}: {err:#}")))
}

fn accepted(attempt_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "attempt_id": attempt_id, "queued": true })),
    )
}
