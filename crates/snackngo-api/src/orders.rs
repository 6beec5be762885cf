use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use snackngo_core::Order;
use snackngo_core::engine::CANCELLED_BY_USER;
use snackngo_types::api::{
    AccountResponse, Claims, OrderResponse, OrderVersionResponse, RejectOrderRequest,
    StartOrderResponse,
};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// Reason recorded when an operator rejects without giving one.
const REJECTED_BY_OPERATOR: &str = "rejected by operator";

/// Owners see their own orders; operators see all.
async fn authorized_order(state: &AppState, claims: &Claims, order_id: Uuid) -> ApiResult<Order> {
    let order = state.engine.order(order_id).await?;
    if claims.admin || order.user_id == Some(claims.sub) {
        Ok(order)
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Account status: total compensation, category and every order.
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<AccountResponse>> {
    Ok(Json(state.engine.account(claims.sub).await?))
}

pub async fn start_order(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let order = state.engine.start_order(claims.sub).await?;
    Ok((
        StatusCode::CREATED,
        Json(StartOrderResponse {
            order_id: order.id,
            channel_id: order.channel_id,
        }),
    ))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<OrderResponse>> {
    let order = authorized_order(&state, &claims, order_id).await?;
    Ok(Json(order.to_view()))
}

pub async fn history(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<OrderVersionResponse>>> {
    authorized_order(&state, &claims, order_id).await?;
    Ok(Json(state.engine.history(order_id).await?))
}

/// Force rejection. An owner without a reason is cancelling.
pub async fn reject(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<RejectOrderRequest>>,
) -> ApiResult<Json<OrderResponse>> {
    authorized_order(&state, &claims, order_id).await?;

    let reason = body
        .and_then(|Json(req)| req.reason)
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| {
            if claims.admin {
                REJECTED_BY_OPERATOR.to_string()
            } else {
                CANCELLED_BY_USER.to_string()
            }
        });

    let order = state.engine.force_reject(order_id, &reason).await?;
    Ok(Json(order.to_view()))
}
