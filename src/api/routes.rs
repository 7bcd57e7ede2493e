//! JSON REST endpoints over [`Core`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router};
use axum::routing::{get, post, put};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use super::error::ApiError;
use crate::config::{ArbitrationSettings, AssistantSettings, SurveyMessages};
use crate::core::Core;
use crate::dispatch::RunKind;
use crate::orders::{OrderContext, Recipient};

type ApiResult<T> = Result<T, ApiError>;

/// Default page size for list endpoints.
const DEFAULT_LIMIT: usize = 50;

pub fn router() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/from-orders", post(start_run_from_orders))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/records", get(list_run_records))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/surveys/dispatch", post(dispatch_survey))
        .route("/api/surveys/manual", post(dispatch_manual_survey))
        .route("/api/surveys/sweep", post(sweep_surveys))
        .route("/api/inbound", post(inbound))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/{id}/messages",
            get(list_messages).post(send_operator_message),
        )
        .route("/api/conversations/{id}/automation", put(set_automation))
        .route("/api/blacklist", get(list_blacklist).post(add_blacklist).delete(remove_blacklist))
        .route(
            "/api/restricted-drivers",
            get(list_drivers).post(add_driver).delete(remove_driver),
        )
        .route(
            "/api/restricted-prefixes",
            get(list_prefixes).post(add_prefix).delete(remove_prefix),
        )
        .route("/api/settings", get(get_settings))
        .route("/api/settings/rate-limits", put(set_rate_limits))
        .route("/api/settings/arbitration", put(set_arbitration))
        .route("/api/settings/survey-messages", put(set_survey_messages))
        .route("/api/settings/assistant", put(set_assistant))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 500)
    }
}

// ── Runs ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartRunBody {
    kind: RunKind,
    template: String,
    recipients: Vec<RecipientBody>,
}

/// A recipient as posted by clients; the phone is normalized here.
#[derive(Debug, Deserialize)]
struct RecipientBody {
    phone: String,
    name: String,
    #[serde(default)]
    orders: Vec<OrderContext>,
}

impl From<RecipientBody> for Recipient {
    fn from(body: RecipientBody) -> Self {
        let mut recipient = Recipient::new(&body.phone, body.name);
        recipient.orders = body.orders;
        recipient
    }
}

async fn start_run(State(core): State<Arc<Core>>, Json(body): Json<StartRunBody>) -> ApiResult<impl IntoResponse> {
    let recipients = body.recipients.into_iter().map(Recipient::from).collect();
    let run_id = core.start_send_run(body.kind, recipients, &body.template).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": run_id }))))
}

#[derive(Debug, Deserialize)]
struct FromOrdersBody {
    kind: RunKind,
    template: String,
    from: NaiveDate,
    to: NaiveDate,
}

async fn start_run_from_orders(
    State(core): State<Arc<Core>>,
    Json(body): Json<FromOrdersBody>,
) -> ApiResult<impl IntoResponse> {
    if body.from > body.to {
        return Err(ApiError::bad_request("`from` is after `to`"));
    }
    let run_id = core
        .start_send_run_from_orders(body.kind, body.from, body.to, &body.template)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": run_id }))))
}

async fn list_runs(State(core): State<Arc<Core>>, Query(q): Query<ListQuery>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_runs(q.limit()).await?))
}

async fn get_run(State(core): State<Arc<Core>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.run_report(id).await?))
}

async fn list_run_records(State(core): State<Arc<Core>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_send_records_for_run(id).await?))
}

async fn cancel_run(State(core): State<Arc<Core>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.cancel_send_run(id).await?))
}

// ── Surveys ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DispatchSurveyBody {
    send_record_id: Uuid,
}

async fn dispatch_survey(
    State(core): State<Arc<Core>>,
    Json(body): Json<DispatchSurveyBody>,
) -> ApiResult<impl IntoResponse> {
    let survey = core.dispatch_survey(body.send_record_id).await?;
    Ok((StatusCode::CREATED, Json(survey)))
}

#[derive(Debug, Deserialize)]
struct ManualSurveyBody {
    phone: String,
    name: String,
    order: Option<OrderContext>,
}

async fn dispatch_manual_survey(
    State(core): State<Arc<Core>>,
    Json(body): Json<ManualSurveyBody>,
) -> ApiResult<impl IntoResponse> {
    let mut recipient = Recipient::new(&body.phone, body.name);
    if let Some(order) = body.order {
        recipient = recipient.with_order(order);
    }
    let survey = core.dispatch_manual_survey(&recipient).await?;
    Ok((StatusCode::CREATED, Json(survey)))
}

async fn sweep_surveys(State(core): State<Arc<Core>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.sweep_surveys().await?))
}

// ── Conversations ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InboundBody {
    phone: String,
    name: Option<String>,
    text: String,
}

/// Gateway webhook for customer messages.
async fn inbound(State(core): State<Arc<Core>>, Json(body): Json<InboundBody>) -> ApiResult<impl IntoResponse> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("empty message"));
    }
    Ok(Json(
        core.accept_message(&body.phone, body.name.as_deref(), &body.text)
            .await?,
    ))
}

async fn list_conversations(
    State(core): State<Arc<Core>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_conversations(q.limit()).await?))
}

async fn list_messages(
    State(core): State<Arc<Core>>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_recent_messages(id, q.limit()).await?))
}

#[derive(Debug, Deserialize)]
struct TextBody {
    text: String,
}

async fn send_operator_message(
    State(core): State<Arc<Core>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TextBody>,
) -> ApiResult<impl IntoResponse> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("empty message"));
    }
    let message = core.send_operator_message(id, &body.text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct AutomationBody {
    active: bool,
}

async fn set_automation(
    State(core): State<Arc<Core>>,
    Path(id): Path<Uuid>,
    Json(body): Json<AutomationBody>,
) -> ApiResult<impl IntoResponse> {
    core.set_conversation_automation(id, body.active).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Rule tables ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BlacklistBody {
    phone: String,
    reason: Option<String>,
}

async fn list_blacklist(State(core): State<Arc<Core>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_blacklist().await?))
}

async fn add_blacklist(State(core): State<Arc<Core>>, Json(body): Json<BlacklistBody>) -> ApiResult<impl IntoResponse> {
    if !crate::phone::is_plausible(&body.phone) {
        return Err(ApiError::bad_request(format!("not a phone number: {}", body.phone)));
    }
    core.add_blacklist_entry(&body.phone, body.reason.as_deref()).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_blacklist(
    State(core): State<Arc<Core>>,
    Json(body): Json<BlacklistBody>,
) -> ApiResult<impl IntoResponse> {
    core.remove_blacklist_entry(&body.phone).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

async fn list_drivers(State(core): State<Arc<Core>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_restricted_drivers().await?))
}

async fn add_driver(State(core): State<Arc<Core>>, Json(body): Json<NameBody>) -> ApiResult<impl IntoResponse> {
    core.add_restricted_driver(&body.name).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_driver(State(core): State<Arc<Core>>, Json(body): Json<NameBody>) -> ApiResult<impl IntoResponse> {
    core.remove_restricted_driver(&body.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PrefixBody {
    prefix: String,
}

async fn list_prefixes(State(core): State<Arc<Core>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.store().list_restricted_prefixes().await?))
}

async fn add_prefix(State(core): State<Arc<Core>>, Json(body): Json<PrefixBody>) -> ApiResult<impl IntoResponse> {
    core.add_restricted_prefix(&body.prefix).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_prefix(State(core): State<Arc<Core>>, Json(body): Json<PrefixBody>) -> ApiResult<impl IntoResponse> {
    core.remove_restricted_prefix(&body.prefix).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Settings ────────────────────────────────────────────────────────

async fn get_settings(State(core): State<Arc<Core>>) -> impl IntoResponse {
    Json(core.settings().snapshot().await)
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    min_seconds: Option<u64>,
    max_seconds: Option<u64>,
}

/// Either bound alone is checked against the other's current value.
async fn set_rate_limits(
    State(core): State<Arc<Core>>,
    Json(body): Json<RateLimitBody>,
) -> ApiResult<impl IntoResponse> {
    let settings = core.settings();
    let bounds = match (body.min_seconds, body.max_seconds) {
        (Some(min), Some(max)) => settings.set_rate_limits(min, max).await?,
        (Some(min), None) => settings.set_min_delay(min).await?,
        (None, Some(max)) => settings.set_max_delay(max).await?,
        (None, None) => return Err(ApiError::bad_request("nothing to update")),
    };
    Ok(Json(bounds))
}

async fn set_arbitration(
    State(core): State<Arc<Core>>,
    Json(body): Json<ArbitrationSettings>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(core.settings().set_arbitration(body).await?))
}

async fn set_survey_messages(
    State(core): State<Arc<Core>>,
    Json(body): Json<SurveyMessages>,
) -> ApiResult<impl IntoResponse> {
    core.settings().set_survey_messages(body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_assistant(
    State(core): State<Arc<Core>>,
    Json(body): Json<AssistantSettings>,
) -> ApiResult<impl IntoResponse> {
    core.settings().set_assistant(body).await?;
    Ok(StatusCode::NO_CONTENT)
}
