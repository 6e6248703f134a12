// =============================================================================
// PACKAGE REDEMPTION SERVICE - Main Entry Point
// =============================================================================
// Multi-tenant ledger of prepaid item bundles.
//
// WHAT THIS SERVICE DOES:
// - Companies define packages (bundles of inventory items with quantities)
// - Packages are assigned to users, one independent instance per assignment
// - Users redeem items from their instances until every line is used up
// - Remaining quantities are always derived from the redemption event log
// - Exposes Prometheus metrics and structured JSON logs
// =============================================================================

mod auth;
mod cache;
mod config;
mod error;
mod handlers;
mod ledger;
mod metrics;
mod middleware;
mod models;
mod policy;
mod services;
mod store;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::PackageCache;
use crate::config::Config;
use crate::metrics::setup_metrics;
use crate::store::{MemoryStore, PgStore, Store};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler behind an `Arc`.
pub struct AppState {
    /// Persistence backend (PostgreSQL or in-memory)
    pub store: Arc<dyn Store>,

    /// Package definition cache, present when REDIS_URL is set and reachable
    pub cache: Option<PackageCache>,

    /// Renders metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    /// Bearer token verification secret
    pub jwt_secret: String,
}

// -----------------------------------------------------------------------------
// ROUTES
// -----------------------------------------------------------------------------
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health, readiness & metrics (no token) -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Package definitions -----
        .route(
            "/packages",
            post(handlers::create_package).get(handlers::list_packages),
        )
        .route(
            "/packages/:id",
            get(handlers::get_package)
                .patch(handlers::update_package)
                .delete(handlers::delete_package),
        )
        // ----- Assignments -----
        .route("/packages/:id/assign", post(handlers::assign_package))
        .route("/packages/:id/users", get(handlers::package_assignments))
        .route("/packages/my-packages", get(handlers::my_packages))
        .route(
            "/packages/user-package/:id",
            get(handlers::get_user_package),
        )
        // ----- Redemption -----
        .route(
            "/packages/user-package/:id/redeem",
            post(handlers::redeem_item),
        )
        // ----- Inventory -----
        .route(
            "/inventory",
            post(handlers::create_inventory).get(handlers::list_inventory),
        )
        .route(
            "/inventory/:id",
            get(handlers::get_inventory)
                .patch(handlers::update_inventory)
                .delete(handlers::delete_inventory),
        )
        // ----- Companies & users -----
        .route(
            "/companies",
            post(handlers::create_company).get(handlers::list_companies),
        )
        .route("/companies/public", get(handlers::list_public_companies))
        .route(
            "/companies/:id",
            get(handlers::get_company)
                .patch(handlers::update_company)
                .delete(handlers::delete_company),
        )
        .route(
            "/users",
            post(handlers::create_user).get(handlers::list_users),
        )
        .route("/users/me", get(handlers::current_user))
        .route(
            "/users/:id",
            get(handlers::get_user)
                .patch(handlers::update_user)
                .delete(handlers::delete_user),
        )
        // ----- Middleware Layers -----
        // Last added runs first: correlation id wraps metrics wraps routing.
        .layer(axum::middleware::from_fn(middleware::track_metrics))
        .layer(axum::middleware::from_fn(middleware::correlation_id))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Structured JSON logs; RUST_LOG overrides the filter.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,package_redemption_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Package Redemption Service...");

    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STORAGE
    // -------------------------------------------------------------------------
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let db = PgStore::connect(url).await?;
            info!("Connected to PostgreSQL");
            db.run_migrations().await?;
            info!("Database migrations completed");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // -------------------------------------------------------------------------
    // CACHE
    // -------------------------------------------------------------------------
    let cache = match &config.redis_url {
        Some(url) => match PackageCache::connect(url).await {
            Ok(cache) => {
                info!("Connected to Redis");
                Some(cache)
            }
            Err(err) => {
                warn!(error = %err, "Redis unavailable, package cache disabled");
                None
            }
        },
        None => None,
    };

    let state = Arc::new(AppState {
        store,
        cache,
        metrics_handle,
        jwt_secret: config.jwt_secret.clone(),
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Package Redemption Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
// Full router over the in-memory store, driven with `tower::ServiceExt`.
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::auth::tests::{mint_token, TEST_SECRET};
    use crate::auth::{Principal, CORRELATION_ID_HEADER};
    use crate::models::Role;
    use crate::services::testing;

    struct Harness {
        app: Router,
        state: Arc<AppState>,
    }

    impl Harness {
        fn new() -> Self {
            let state = testing::state();
            Self {
                app: build_router(state.clone()),
                state,
            }
        }

        async fn send(&self, method: &str, uri: &str, who: Option<&Principal>, body: Option<Value>) -> Response {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(principal) = who {
                request = request.header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", mint_token(principal, TEST_SECRET)),
                );
            }
            let body = match body {
                Some(json) => {
                    request = request.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            self.app
                .clone()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap()
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Company with an admin, a plain user and one stock item.
    async fn tenant(h: &Harness, name: &str) -> (Principal, Principal, String) {
        let company = testing::company(&h.state, name).await;
        let admin = testing::member(&h.state, Role::CompanyAdmin, Some(company)).await;
        let user = testing::member(&h.state, Role::User, Some(company)).await;

        let response = h
            .send(
                "POST",
                "/inventory",
                Some(&admin),
                Some(json!({
                    "stockCode": "WB-500",
                    "itemName": "Water bottle",
                    "quantity": 500,
                    "unit": "bottle"
                })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let item_id = json_body(response).await["id"].as_str().unwrap().to_string();
        (admin, user, item_id)
    }

    async fn create_package(h: &Harness, admin: &Principal, item_id: &str, quantity: i32) -> String {
        let response = h
            .send(
                "POST",
                "/packages",
                Some(admin),
                Some(json!({
                    "name": "10 Water Bottles",
                    "items": [{ "inventoryItemId": item_id, "quantity": quantity }]
                })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_public_and_echoes_correlation_id() {
        let h = Harness::new();
        let id = Uuid::new_v4().to_string();
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(CORRELATION_ID_HEADER, &id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CORRELATION_ID_HEADER).unwrap(), id.as_str());

        let ready = h.send("GET", "/ready", None, None).await;
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(json_body(ready).await["checks"]["storage"], true);
    }

    #[tokio::test]
    async fn missing_or_forged_token_is_unauthorized() {
        let h = Harness::new();
        let response = h.send("GET", "/packages", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");

        let forged = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/packages/my-packages")
                    .header(header::AUTHORIZATION, "Bearer not.a.jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ten_water_bottles_over_http() {
        let h = Harness::new();
        let (admin, user, item_id) = tenant(&h, "Acme").await;
        let package_id = create_package(&h, &admin, &item_id, 10).await;

        let response = h
            .send(
                "POST",
                &format!("/packages/{package_id}/assign"),
                Some(&admin),
                Some(json!({ "userIds": [user.id] })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let instances = json_body(response).await;
        let instance_id = instances[0]["id"].as_str().unwrap().to_string();
        assert_eq!(instances[0]["status"], "active");

        let redeem_uri = format!("/packages/user-package/{instance_id}/redeem");
        let first = h
            .send(
                "POST",
                &redeem_uri,
                Some(&user),
                Some(json!({ "inventoryItemId": item_id, "quantity": 4 })),
            )
            .await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let event = json_body(first).await;
        assert_eq!(event["quantity"], 4);
        assert_eq!(event["inventoryItem"]["stockCode"], "WB-500");

        let second = h
            .send(
                "POST",
                &redeem_uri,
                Some(&user),
                Some(json!({ "inventoryItemId": item_id, "quantity": 6 })),
            )
            .await;
        assert_eq!(second.status(), StatusCode::CREATED);

        let detail = h
            .send(
                "GET",
                &format!("/packages/user-package/{instance_id}"),
                Some(&user),
                None,
            )
            .await;
        let detail = json_body(detail).await;
        assert_eq!(detail["status"], "completed");
        assert_eq!(detail["progress"][0]["remaining"], 0);

        let third = h
            .send(
                "POST",
                &redeem_uri,
                Some(&user),
                Some(json!({ "inventoryItemId": item_id, "quantity": 1 })),
            )
            .await;
        assert_eq!(third.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(third).await["error"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn cross_company_assignment_is_forbidden_and_writes_nothing() {
        let h = Harness::new();
        let (admin, user, item_id) = tenant(&h, "Acme").await;
        let (_, outsider, _) = tenant(&h, "Globex").await;
        let package_id = create_package(&h, &admin, &item_id, 10).await;

        let response = h
            .send(
                "POST",
                &format!("/packages/{package_id}/assign"),
                Some(&admin),
                Some(json!({ "userIds": [user.id, outsider.id] })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let listed = h
            .send("GET", &format!("/packages/{package_id}/users"), Some(&admin), None)
            .await;
        assert_eq!(listed.status(), StatusCode::OK);
        assert_eq!(json_body(listed).await, json!([]));
    }

    #[tokio::test]
    async fn instances_are_visible_only_to_their_holder() {
        let h = Harness::new();
        let (admin, user, item_id) = tenant(&h, "Acme").await;
        let package_id = create_package(&h, &admin, &item_id, 10).await;
        let response = h
            .send(
                "POST",
                &format!("/packages/{package_id}/assign"),
                Some(&admin),
                Some(json!({ "userIds": [user.id] })),
            )
            .await;
        let instance_id = json_body(response).await[0]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let as_admin = h
            .send(
                "GET",
                &format!("/packages/user-package/{instance_id}"),
                Some(&admin),
                None,
            )
            .await;
        assert_eq!(as_admin.status(), StatusCode::NOT_FOUND);

        let redeem_as_admin = h
            .send(
                "POST",
                &format!("/packages/user-package/{instance_id}/redeem"),
                Some(&admin),
                Some(json!({ "inventoryItemId": item_id, "quantity": 1 })),
            )
            .await;
        assert_eq!(redeem_as_admin.status(), StatusCode::NOT_FOUND);

        let mine = h.send("GET", "/packages/my-packages", Some(&user), None).await;
        assert_eq!(json_body(mine).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn package_routes_need_an_admin_with_a_company() {
        let h = Harness::new();
        let (_, user, _) = tenant(&h, "Acme").await;
        let root = testing::member(&h.state, Role::SuperAdmin, None).await;

        let as_user = h.send("GET", "/packages", Some(&user), None).await;
        assert_eq!(as_user.status(), StatusCode::FORBIDDEN);

        let as_root = h.send("GET", "/packages", Some(&root), None).await;
        assert_eq!(as_root.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(as_root).await["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn invalid_package_body_is_a_validation_error() {
        let h = Harness::new();
        let (admin, _, item_id) = tenant(&h, "Acme").await;

        let response = h
            .send(
                "POST",
                "/packages",
                Some(&admin),
                Some(json!({
                    "name": "Broken",
                    "items": [{ "inventoryItemId": item_id, "quantity": 0 }]
                })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn deleting_a_package_removes_its_instances() {
        let h = Harness::new();
        let (admin, user, item_id) = tenant(&h, "Acme").await;
        let package_id = create_package(&h, &admin, &item_id, 10).await;
        h.send(
            "POST",
            &format!("/packages/{package_id}/assign"),
            Some(&admin),
            Some(json!({ "userIds": [user.id] })),
        )
        .await;

        let deleted = h
            .send("DELETE", &format!("/packages/{package_id}"), Some(&admin), None)
            .await;
        assert_eq!(deleted.status(), StatusCode::OK);

        let again = h
            .send("GET", &format!("/packages/{package_id}"), Some(&admin), None)
            .await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let mine = h.send("GET", "/packages/my-packages", Some(&user), None).await;
        assert_eq!(json_body(mine).await, json!([]));
    }

    #[tokio::test]
    async fn malformed_ids_and_bodies_are_validation_errors() {
        let h = Harness::new();
        let (admin, user, item_id) = tenant(&h, "Acme").await;
        let package_id = create_package(&h, &admin, &item_id, 10).await;

        let bad_id = h.send("GET", "/packages/not-a-uuid", Some(&admin), None).await;
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(bad_id).await["error"], "VALIDATION_ERROR");

        let assigned = h
            .send(
                "POST",
                &format!("/packages/{package_id}/assign"),
                Some(&admin),
                Some(json!({ "userIds": [user.id] })),
            )
            .await;
        let instance_id = json_body(assigned).await[0]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let bad_quantity = h
            .send(
                "POST",
                &format!("/packages/user-package/{instance_id}/redeem"),
                Some(&user),
                Some(json!({ "inventoryItemId": item_id, "quantity": "x" })),
            )
            .await;
        assert_eq!(bad_quantity.status(), StatusCode::BAD_REQUEST);
        let body = json_body(bad_quantity).await;
        assert_eq!(body["error"], "VALIDATION_ERROR");
        assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));

        let no_body = h
            .send("POST", "/packages", Some(&admin), None)
            .await;
        assert_eq!(no_body.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(no_body).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn directory_routes_over_http() {
        let h = Harness::new();
        let (admin, user, _) = tenant(&h, "Acme").await;
        let root = testing::member(&h.state, Role::SuperAdmin, None).await;

        let me = h.send("GET", "/users/me", Some(&user), None).await;
        assert_eq!(me.status(), StatusCode::OK);
        assert_eq!(json_body(me).await["id"], json!(user.id));

        let public = h.send("GET", "/companies/public", Some(&user), None).await;
        assert_eq!(public.status(), StatusCode::OK);
        assert_eq!(json_body(public).await.as_array().unwrap().len(), 1);

        let as_user = h
            .send("GET", &format!("/users/{}", admin.id), Some(&user), None)
            .await;
        assert_eq!(as_user.status(), StatusCode::FORBIDDEN);

        let renamed = h
            .send(
                "PATCH",
                &format!("/users/{}", user.id),
                Some(&admin),
                Some(json!({ "lastName": "Renamed" })),
            )
            .await;
        assert_eq!(renamed.status(), StatusCode::OK);
        assert_eq!(json_body(renamed).await["lastName"], "Renamed");

        let company_id = admin.company_id.unwrap();
        let occupied = h
            .send("DELETE", &format!("/companies/{company_id}"), Some(&root), None)
            .await;
        assert_eq!(occupied.status(), StatusCode::CONFLICT);

        let removed = h
            .send("DELETE", &format!("/users/{}", user.id), Some(&admin), None)
            .await;
        assert_eq!(removed.status(), StatusCode::OK);
        let gone = h
            .send("GET", &format!("/users/{}", user.id), Some(&admin), None)
            .await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }
}
