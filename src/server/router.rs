//! Axum router construction.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, patch, post, put};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::state::AppState;
use super::{admin, handlers, middleware};

pub fn build(state: AppState) -> Router {
    let osb = Router::new()
        .route("/v2/catalog", get(handlers::catalog))
        .route(
            "/v2/service_instances/:instance_id",
            put(handlers::provision)
                .patch(handlers::update)
                .delete(handlers::deprovision)
                .get(handlers::get_instance),
        )
        .route(
            "/v2/service_instances/:instance_id/last_operation",
            get(handlers::last_operation),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id",
            put(handlers::bind).delete(handlers::unbind).get(handlers::get_binding),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id/last_operation",
            get(handlers::last_binding_operation),
        )
        .layer(from_fn(middleware::api_version))
        .layer(from_fn_with_state(state.clone(), middleware::basic_auth));

    let protected_admin = Router::new()
        .route("/import_state/:instance_id", patch(admin::import_state))
        .route("/migrate", post(admin::migrate))
        .layer(from_fn_with_state(state.clone(), middleware::basic_auth));

    let admin = Router::new()
        .route("/", get(admin::liveness).head(admin::liveness))
        .route("/info", get(admin::info))
        .route("/examples", get(admin::examples))
        .route("/docs", get(admin::docs))
        .merge(protected_admin)
        .layer(TimeoutLayer::new(middleware::ADMIN_TIMEOUT));

    Router::new()
        .merge(osb)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;
    use tower::ServiceExt;

    use super::*;
    use crate::broker::{Catalog, ServiceBroker};
    use crate::config::Config;
    use crate::deployment::DeploymentManager;
    use crate::encryption::noop::NoopEncryptor;
    use crate::executor::ProcessRunner;
    use crate::server::state::Credentials;
    use crate::storage::{migration, Database, Storage};

    fn empty_state() -> AppState {
        let config = Config::load(HashMap::new()).unwrap();
        let db = Database::open_memory().unwrap();
        migration::run_migrations(&db).unwrap();
        let storage = Storage::new(Arc::new(db), Arc::new(NoopEncryptor::new()));
        let manager = Arc::new(DeploymentManager::new(storage, None, config.flags));
        let broker = ServiceBroker::new(
            Catalog::build(Vec::new(), &config).unwrap(),
            manager,
            Arc::new(ProcessRunner::new()),
            CancellationToken::new(),
            TaskTracker::new(),
            BTreeMap::new(),
        );
        AppState::new(Arc::new(broker), Credentials::default())
    }

    #[tokio::test]
    async fn liveness_skips_the_version_check() {
        let resp = build(empty_state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_catalog() {
        let app = build(empty_state());

        let resp = app
            .clone()
            .oneshot(Request::get("/v2/catalog").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

        let resp = app
            .oneshot(
                Request::get("/v2/catalog")
                    .header(middleware::API_VERSION_HEADER, "2.14")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"services":[]}"#);
    }
}
