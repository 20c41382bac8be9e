//! Newsletter campaign management endpoints.
//!
//! Staff create drafts, edit copy and pacing policy, then either send
//! immediately or confirm a schedule for the background dispatcher to
//! pick up. Rate-limit refusals surface as `429`.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tavola_core::NewsletterId;

use crate::error::AppError;
use crate::models::{CreateNewsletter, Newsletter, NewsletterStats, UpdateNewsletter};
use crate::services::newsletter::{NewsletterAdmin, NewsletterError};
use crate::state::AppState;

/// Build the newsletter router, nested under `/api/admin/newsletters`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/stats", get(stats))
        .route("/{id}", get(show).patch(update).delete(delete))
        .route("/{id}/send", post(send))
}

/// Body for `POST /{id}/send`.
#[derive(Debug, Deserialize)]
struct SendRequest {
    /// Send to the resolved audience right now instead of confirming the
    /// stored schedule.
    #[serde(default)]
    send_immediately: bool,
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<Newsletter>>, AppError> {
    let newsletters = state.newsletters().list().await?;
    Ok(Json(newsletters))
}

async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateNewsletter>,
) -> Result<(StatusCode, Json<Newsletter>), AppError> {
    if input.title.trim().is_empty() || input.subject.trim().is_empty() {
        return Err(AppError::BadRequest(
            "title and subject must not be empty".to_string(),
        ));
    }

    let newsletter = state.newsletters().create(input).await?;
    tracing::info!(newsletter_id = %newsletter.id, "Newsletter created");
    Ok((StatusCode::CREATED, Json(newsletter)))
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<NewsletterId>,
) -> Result<Json<Newsletter>, AppError> {
    let newsletter = state
        .newsletters()
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("newsletter {id}")))?;
    Ok(Json(newsletter))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<NewsletterId>,
    Json(patch): Json<UpdateNewsletter>,
) -> Result<Json<Newsletter>, AppError> {
    let newsletter = state.newsletters().update(id, patch).await?;
    Ok(Json(newsletter))
}

async fn delete(
    State(state): State<AppState>,
    Path(id): Path<NewsletterId>,
) -> Result<StatusCode, AppError> {
    state.newsletters().delete(id).await?;
    tracing::info!(newsletter_id = %id, "Newsletter deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Send a newsletter now, or confirm its schedule.
///
/// With `send_immediately` the campaign goes out in this request (rate
/// limit permitting). Otherwise the stored `scheduled_date` is confirmed
/// by flipping `is_scheduled`, and the background dispatcher sends it
/// when the date arrives.
async fn send(
    State(state): State<AppState>,
    Path(id): Path<NewsletterId>,
    Json(request): Json<SendRequest>,
) -> Result<Json<Value>, AppError> {
    if request.send_immediately {
        let outcome = state.automation().send_newsletter(id).await?;
        tracing::info!(
            newsletter_id = %id,
            delivered = outcome.delivered,
            errors = outcome.errors,
            "Newsletter sent via admin API"
        );
        return Ok(Json(json!({
            "status": "sent",
            "recipients": outcome.recipients,
            "delivered": outcome.delivered,
            "errors": outcome.errors,
        })));
    }

    let newsletter = state
        .newsletters()
        .get(id)
        .await?
        .ok_or(NewsletterError::NotFound)
        .map_err(AppError::Newsletter)?;
    if newsletter.scheduled_date.is_none() {
        return Err(AppError::Newsletter(NewsletterError::NotScheduled));
    }

    let confirmed = state
        .newsletters()
        .update(
            id,
            UpdateNewsletter {
                is_scheduled: Some(true),
                ..UpdateNewsletter::default()
            },
        )
        .await?;
    Ok(Json(json!({
        "status": "scheduled",
        "scheduled_date": confirmed.scheduled_date,
    })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<NewsletterStats>, AppError> {
    let stats = state.newsletters().stats().await?;
    Ok(Json(stats))
}
