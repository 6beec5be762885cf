use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use tracing::{error, info};
use uuid::Uuid;

use snackngo_core::input::parse_field_value;
use snackngo_core::store::{FieldPatch, OrderPatch};
use snackngo_db::export::EXPORTABLE_TABLES;
use snackngo_types::api::{
    BroadcastRequest, BroadcastResponse, CorrectOrderRequest, FieldCorrection, OrderResponse,
    SetUserStatusRequest, UserResponse,
};
use snackngo_types::models::CandidateSource;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<UserResponse>>> {
    let users = state.engine.store().list_users().await?;
    Ok(Json(users.iter().map(|u| u.to_response()).collect()))
}

pub async fn set_user_status(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SetUserStatusRequest>,
) -> ApiResult<Json<UserResponse>> {
    let user = state.engine.set_user_status(user_id, req.status).await?;
    Ok(Json(user.to_response()))
}

/// Operator correction of an order's fields.
pub async fn correct_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<CorrectOrderRequest>,
) -> ApiResult<Json<OrderResponse>> {
    let offset = state.engine.config().utc_offset;

    let mut patch = OrderPatch {
        app_used: req.app_used,
        ..OrderPatch::default()
    };
    for correction in req.fields {
        patch = match correction {
            FieldCorrection::Set {
                field,
                value,
                verify,
            } => {
                let value = parse_field_value(field, &value, offset)
                    .map_err(|reason| ApiError::BadRequest(format!("{}: {}", field, reason)))?;
                let patch = patch.field(
                    field,
                    FieldPatch::Propose {
                        value,
                        source: CandidateSource::Manual,
                    },
                );
                if verify {
                    patch.field(field, FieldPatch::Verify)
                } else {
                    patch
                }
            }
            FieldCorrection::Verify { field } => patch.field(field, FieldPatch::Verify),
            FieldCorrection::Clear { field } => patch.field(field, FieldPatch::Clear),
        };
    }
    if patch.is_empty() {
        return Err(ApiError::BadRequest("nothing to change".into()));
    }

    let order = state.engine.correct_fields(order_id, patch).await?;
    info!(%order_id, version = order.version, "operator corrected order");
    Ok(Json(order.to_view()))
}

/// Send a notice to every active user.
pub async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> ApiResult<Json<BroadcastResponse>> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let (recipients, delivered) = state.engine.broadcast(message).await?;
    Ok(Json(BroadcastResponse {
        recipients,
        delivered,
    }))
}

/// Dump `users` or `orders` as CSV.
pub async fn export_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !EXPORTABLE_TABLES.contains(&table.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "table must be one of: {}",
            EXPORTABLE_TABLES.join(", ")
        )));
    }

    // Run blocking DB read off the async runtime
    let db = state.engine.store().database().clone();
    let name = table.clone();
    let csv = tokio::task::spawn_blocking(move || db.export_table_csv(&name))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(e.to_string())
        })?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let disposition = format!("attachment; filename=\"{}.csv\"", table);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}
