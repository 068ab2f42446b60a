//! HTTP routes for the chat adapter

pub mod dialog;
pub mod owner;
pub mod transfers;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_api_key, state::AppState};

/// Build the application router.
///
/// Everything under `/v1` requires the shared API key; `/health` stays open
/// for load balancer probes.
pub fn create_router(state: AppState) -> Router {
    let v1 = Router::new()
        // Dialogue
        .route("/dialog", post(dialog::step).get(dialog::current))
        // Self-service
        .route("/me", get(dialog::me))
        .route("/me/clients", get(dialog::my_clients))
        .route("/me/statement", get(dialog::my_statement))
        // Repayments
        .route("/transfers", post(transfers::create))
        .route("/transfers/{id}/approve", post(transfers::approve))
        .route("/transfers/{id}/reject", post(transfers::reject))
        // Owner and admins
        .route(
            "/owner/agents",
            get(owner::list_agents).post(owner::register_agent),
        )
        .route("/owner/agents/{id}", delete(owner::delete_agent))
        .route(
            "/owner/agents/{id}/credit-limit",
            put(owner::set_credit_limit),
        )
        .route("/owner/agents/{id}/active", put(owner::set_active))
        .route("/owner/agents/{id}/statement", get(owner::agent_statement))
        .route("/owner/clients/{id}", delete(owner::delete_client))
        .route("/owner/transfers", get(transfers::list))
        .route("/owner/reconcile", post(owner::reconcile))
        .route("/owner/expiring", get(owner::expiring))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, sync::Arc};

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use resell_ledger::ResellerService;
    use resell_shared::Config;
    use tower::ServiceExt;

    const KEY: &str = "test-key";
    const OWNER: i64 = 1;
    const AGENT: i64 = 500;

    fn test_config() -> Config {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://localhost/resell_test"),
            ("REMNAWAVE_BASE_URL", "http://127.0.0.1:9"),
            ("REMNAWAVE_API_KEY", "test"),
            ("OWNER_TELEGRAM_ID", "1"),
            ("ADMIN_IDS", "2"),
        ]
        .into_iter()
        .collect();
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    fn app() -> Router {
        let (service, _gateway) = ResellerService::in_memory(Arc::new(test_config()));
        create_router(AppState::new(service, KEY))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        telegram_id: Option<i64>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", KEY);
        if let Some(id) = telegram_id {
            builder = builder.header("x-telegram-id", id.to_string());
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register_agent(app: &Router, telegram_id: i64) -> i64 {
        let (status, body) = call(
            app,
            Method::POST,
            "/v1/owner/agents",
            Some(OWNER),
            Some(json!({ "telegram_id": telegram_id, "name": "Ivan" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    #[tokio::test]
    async fn test_health_is_open() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_rejected() {
        let response = app()
            .oneshot(
                Request::get("/v1/me")
                    .header("x-telegram-id", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_telegram_id_is_bad_request() {
        let (status, body) = call(&app(), Method::GET, "/v1/me", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "missing_actor");
    }

    #[tokio::test]
    async fn test_unregistered_user_is_forbidden() {
        let (status, body) = call(&app(), Method::GET, "/v1/me", Some(AGENT), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "access_denied");
    }

    // =========================================================================
    // Owner routes
    // =========================================================================

    #[tokio::test]
    async fn test_owner_routes_refuse_plain_agents() {
        let app = app();
        register_agent(&app, AGENT).await;

        let (status, _) = call(&app, Method::GET, "/v1/owner/agents", Some(AGENT), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, Method::GET, "/v1/owner/agents", Some(OWNER), None).await;
        assert_eq!(status, StatusCode::OK);
        // The owner's own record plus the registered agent
        assert_eq!(body["agents"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_credit_limit_update() {
        let app = app();
        let agent_id = register_agent(&app, AGENT).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/v1/owner/agents/{agent_id}/credit-limit"),
            Some(OWNER),
            Some(json!({ "credit_limit": 1000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credit_limit"], 1000);

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/v1/owner/agents/{agent_id}/credit-limit"),
            Some(OWNER),
            Some(json!({ "credit_limit": -5 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_deactivation_clears_the_agents_dialogue() {
        let app = app();
        let agent_id = register_agent(&app, AGENT).await;
        call(
            &app,
            Method::POST,
            "/v1/dialog",
            Some(AGENT),
            Some(json!({ "kind": "start_create" })),
        )
        .await;

        for is_active in [false, true] {
            let (status, _) = call(
                &app,
                Method::PUT,
                &format!("/v1/owner/agents/{agent_id}/active"),
                Some(OWNER),
                Some(json!({ "is_active": is_active })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        // Reactivated, the agent starts from the menu
        let (status, session) = call(&app, Method::GET, "/v1/dialog", Some(AGENT), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["flow"], "idle");
    }

    // =========================================================================
    // Dialogue
    // =========================================================================

    #[tokio::test]
    async fn test_dialog_walks_the_creation_prompts() {
        let app = app();
        register_agent(&app, AGENT).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/dialog",
            Some(AGENT),
            Some(json!({ "kind": "start_create" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"]["outcome"], "prompt");
        assert_eq!(body["outcome"]["prompt"]["prompt"], "username");

        let (_, body) = call(
            &app,
            Method::POST,
            "/v1/dialog",
            Some(AGENT),
            Some(json!({ "kind": "text", "text": "ivan_01" })),
        )
        .await;
        assert_eq!(body["outcome"]["prompt"]["prompt"], "days");

        let (status, session) = call(&app, Method::GET, "/v1/dialog", Some(AGENT), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["flow"], "create");
        assert_eq!(session["step"], "awaiting_days");
        assert_eq!(session["username"], "ivan_01");
    }

    #[tokio::test]
    async fn test_invalid_username_keeps_prompt() {
        let app = app();
        register_agent(&app, AGENT).await;

        call(
            &app,
            Method::POST,
            "/v1/dialog",
            Some(AGENT),
            Some(json!({ "kind": "start_create" })),
        )
        .await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/dialog",
            Some(AGENT),
            Some(json!({ "kind": "text", "text": "no spaces allowed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"]["outcome"], "retry");
        assert_eq!(body["session"]["step"], "awaiting_username");
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    #[tokio::test]
    async fn test_transfer_is_decided_once() {
        let app = app();
        register_agent(&app, AGENT).await;

        let (status, request) = call(
            &app,
            Method::POST,
            "/v1/transfers",
            Some(AGENT),
            Some(json!({ "amount": 150 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = request["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/transfers/{id}/approve"),
            Some(AGENT),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/transfers/{id}/approve"),
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/v1/transfers/{id}/reject"),
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already_processed");
    }

    #[tokio::test]
    async fn test_non_positive_transfer_is_unprocessable() {
        let app = app();
        register_agent(&app, AGENT).await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/transfers",
            Some(AGENT),
            Some(json!({ "amount": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_owner_lists_pending_transfers_then_approves() {
        let app = app();
        register_agent(&app, AGENT).await;

        for amount in [150, 70] {
            let (status, _) = call(
                &app,
                Method::POST,
                "/v1/transfers",
                Some(AGENT),
                Some(json!({ "amount": amount })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, _) = call(
            &app,
            Method::GET,
            "/v1/owner/transfers?status=pending",
            Some(AGENT),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &app,
            Method::GET,
            "/v1/owner/transfers?status=pending",
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let pending = body.as_array().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0]["amount"], 150);
        assert_eq!(pending[0]["status"], "pending");
        let id = pending[0]["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/v1/transfers/{id}/approve"),
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(
            &app,
            Method::GET,
            "/v1/owner/transfers?status=pending",
            Some(OWNER),
            None,
        )
        .await;
        let pending = body.as_array().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["amount"], 70);

        let (status, body) = call(
            &app,
            Method::GET,
            "/v1/owner/transfers?status=approved",
            Some(OWNER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }
}
