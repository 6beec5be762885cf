//! REST surface: registration, account status, order views and operator tools.

pub mod admin;
pub mod auth;
pub mod error;
pub mod middleware;
pub mod orders;

use axum::{
    Router, middleware as layer,
    routing::{get, patch, post, put},
};

use crate::auth::AppState;
use crate::middleware::{require_admin, require_auth};

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/users", post(auth::register))
        .route("/auth/admin", post(auth::admin_token));

    let admin_routes = Router::new()
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/{user_id}/status", put(admin::set_user_status))
        .route("/admin/orders/{order_id}", patch(admin::correct_order))
        .route("/admin/export/{table}", get(admin::export_table))
        .route("/admin/broadcast", post(admin::broadcast))
        .layer(layer::from_fn(require_admin));

    let protected_routes = Router::new()
        .route("/users/me", get(orders::me))
        .route("/orders", post(orders::start_order))
        .route("/orders/{order_id}", get(orders::get_order))
        .route("/orders/{order_id}/history", get(orders::history))
        .route("/orders/{order_id}/reject", post(orders::reject))
        .merge(admin_routes)
        .layer(layer::from_fn_with_state(state.clone(), require_auth));

    public_routes.merge(protected_routes).with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use snackngo_core::OrderEngine;
    use snackngo_core::OrderStore;
    use snackngo_core::collaborators::{
        Candidates, ChatTransport, ExtractionError, Extractor,
    };
    use snackngo_core::config::EngineConfig;
    use snackngo_db::Database;
    use snackngo_types::events::Prompt;
    use snackngo_types::models::Stage;

    use super::*;
    use crate::auth::AppStateInner;

    struct NoExtractor;

    #[async_trait]
    impl Extractor for NoExtractor {
        async fn extract(&self, _: &str, _: Stage) -> Result<Candidates, ExtractionError> {
            Err(ExtractionError::NoFields)
        }
    }

    struct SilentChat;

    #[async_trait]
    impl ChatTransport for SilentChat {
        async fn open_channel(&self, order_id: Uuid, _: Uuid) -> anyhow::Result<String> {
            Ok(format!("order-upload-{}", order_id.simple()))
        }

        async fn prompt_user(&self, _: Uuid, _: &str, _: &Prompt) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn app() -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let engine = OrderEngine::new(
            OrderStore::new(db),
            Arc::new(NoExtractor),
            Arc::new(SilentChat),
            EngineConfig::default(),
        );
        router(Arc::new(AppStateInner {
            engine,
            jwt_secret: "test-secret".into(),
            admin_key: Some("let-me-in".into()),
        }))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn json_of(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn register(app: &Router, username: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/users",
            None,
            Some(json!({ "username": username, "email": format!("{}@example.com", username) })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        json_of(&body)["token"].as_str().unwrap().to_string()
    }

    async fn admin_token(app: &Router) -> String {
        let (status, body) =
            call(app, "POST", "/auth/admin", None, Some(json!({ "key": "let-me-in" }))).await;
        assert_eq!(status, StatusCode::OK);
        json_of(&body)["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn account_requires_a_token() {
        let app = app();
        let (status, _) = call(&app, "GET", "/users/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = register(&app, "alice").await;
        let (status, body) = call(&app, "GET", "/users/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let account = json_of(&body);
        assert_eq!(account["user"]["username"], "alice");
        assert_eq!(account["orders"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let app = app();
        register(&app, "alice").await;
        let (status, _) = call(
            &app,
            "POST",
            "/users",
            None,
            Some(json!({ "username": "alice", "email": "other@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn orders_are_private_to_their_owner() {
        let app = app();
        let alice = register(&app, "alice").await;
        let bob = register(&app, "bob").await;

        let (status, body) = call(&app, "POST", "/orders", Some(&alice), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let order_id = json_of(&body)["order_id"].as_str().unwrap().to_string();

        let uri = format!("/orders/{}", order_id);
        let (status, body) = call(&app, "GET", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["status"]["state"], "awaiting_app_selection");

        let (status, _) = call(&app, "GET", &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "GET", &format!("/orders/{}", Uuid::new_v4()), Some(&alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", &format!("{}/history", uri), Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body).as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn owner_reject_cancels_and_is_final() {
        let app = app();
        let alice = register(&app, "alice").await;
        let (_, body) = call(&app, "POST", "/orders", Some(&alice), None).await;
        let order_id = json_of(&body)["order_id"].as_str().unwrap().to_string();
        let uri = format!("/orders/{}/reject", order_id);

        let (status, body) = call(&app, "POST", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        let order = json_of(&body);
        assert_eq!(order["status"]["state"], "rejected");
        assert_eq!(order["rejection_reason"], "cancelled by user");

        let (status, _) = call(&app, "POST", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn admin_routes_need_an_operator_token() {
        let app = app();
        let alice = register(&app, "alice").await;

        let (status, _) = call(&app, "GET", "/admin/users", Some(&alice), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) =
            call(&app, "POST", "/auth/admin", None, Some(json!({ "key": "wrong" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let admin = admin_token(&app).await;
        let (status, body) = call(&app, "GET", "/admin/users", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body).as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/admin/export/users", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        let csv = String::from_utf8(body).unwrap();
        assert!(csv.lines().next().unwrap().contains("username"));
        assert!(csv.contains("alice"));

        let (status, _) = call(&app, "GET", "/admin/export/order_versions", Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deactivated_user_cannot_start_orders() {
        let app = app();
        let alice = register(&app, "alice").await;
        let admin = admin_token(&app).await;

        let (_, body) = call(&app, "GET", "/users/me", Some(&alice), None).await;
        let user_id = json_of(&body)["user"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            "PUT",
            &format!("/admin/users/{}/status", user_id),
            Some(&admin),
            Some(json!({ "status": "inactive" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, "POST", "/orders", Some(&alice), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn operator_corrects_app_used() {
        let app = app();
        let alice = register(&app, "alice").await;
        let admin = admin_token(&app).await;
        let (_, body) = call(&app, "POST", "/orders", Some(&alice), None).await;
        let order_id = json_of(&body)["order_id"].as_str().unwrap().to_string();
        let uri = format!("/admin/orders/{}", order_id);

        let (status, body) =
            call(&app, "PATCH", &uri, Some(&admin), Some(json!({ "app_used": "Uber Eats" }))).await;
        assert_eq!(status, StatusCode::OK);
        let order = json_of(&body);
        assert_eq!(order["app_used"], "Uber Eats");
        assert_eq!(order["version"], 2);

        let (status, _) = call(&app, "PATCH", &uri, Some(&admin), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn operator_broadcast_counts_active_users() {
        let app = app();
        register(&app, "alice").await;
        register(&app, "bob").await;
        let admin = admin_token(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/admin/broadcast",
            Some(&admin),
            Some(json!({ "message": "maintenance at noon" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let sent = json_of(&body);
        assert_eq!(sent["recipients"], 2);
        assert_eq!(sent["delivered"], 0);

        let (status, _) = call(
            &app,
            "POST",
            "/admin/broadcast",
            Some(&admin),
            Some(json!({ "message": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
