//! Axum router construction.
//!
//! The cache has only two meaningful path shapes, `/ac/<key>` and
//! `/cas/<key>`, and the object key is the raw path.  Rather than let the
//! router parse keys, every request that is not an infrastructure endpoint
//! falls through to [`dispatch`], which classifies it with
//! [`codec::classify`], authenticates, and hands off to the cache handlers.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::codec::{self, Operation};
use crate::errors::{generate_request_id, CacheError};
use crate::handlers::cache;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] for the cache.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router: Router<Arc<AppState>> = Router::new();

    if state.config.observability.health_check {
        router = router.route("/health", get(health_check).fallback(not_found));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler).fallback(not_found));
    }

    router
        // Everything else, including both cache namespaces.
        .fallback(dispatch)
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // Object size is enforced while streaming, against max_object_size.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `date` and `server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("buildstash"));

    response
}

// -- Cache dispatch ----------------------------------------------------------

/// Route a request to upload or retrieve.  Unknown routes are 404 before
/// any credential check; known routes require valid credentials.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Result<Response, CacheError> {
    let Some(route) = codec::classify(req.method(), req.uri()) else {
        debug!("No route for {} {}", req.method(), req.uri().path());
        return Err(CacheError::NotFound);
    };

    authenticate(&state, req.headers()).await?;

    match route.operation {
        Operation::Upload => cache::upload(state, &route.object_key, req.into_body()).await,
        Operation::Retrieve => cache::retrieve(state, &route.object_key).await,
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(), CacheError> {
    if state.auth.is_authenticated(headers).await? {
        Ok(())
    } else {
        Err(CacheError::Unauthenticated)
    }
}

// -- Infrastructure endpoints ------------------------------------------------

/// `GET /health` -- liveness probe.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn not_found() -> CacheError {
    CacheError::NotFound
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::memory::MemoryMetadataIndex;
    use crate::metadata::store::MetadataIndex;
    use crate::storage::memory::MemoryBackend;
    use tower::ServiceExt;

    const ID_HEADER: &str = "x-cache-credential-id";
    const SECRET_HEADER: &str = "x-cache-credential-secret";

    async fn test_state() -> Arc<AppState> {
        let state = Arc::new(AppState::new(
            Config::default(),
            Arc::new(MemoryMetadataIndex::new()),
            Arc::new(MemoryBackend::new()),
        ));
        state.auth.provision("alice", "secret1").await.unwrap();
        state
    }

    fn request(method: &str, uri: &str, creds: Option<(&str, &str)>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, secret)) = creds {
            builder = builder.header(ID_HEADER, id).header(SECRET_HEADER, secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const ALICE: Option<(&str, &str)> = Some(("alice", "secret1"));

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let state = test_state().await;

        let response = app(state.clone())
            .oneshot(request("PUT", "/cas/abc", ALICE, "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app(state.clone())
            .oneshot(request("GET", "/cas/abc", ALICE, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(body_string(response).await, "hello");

        state.background.settle().await;
        assert!(state.metadata.get("cas/abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let state = test_state().await;
        for method in ["GET", "PUT"] {
            let response = app(state.clone())
                .oneshot(request(method, "/ac/1", Some(("alice", "wrong")), "x"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        // Rejected uploads never reach either store.
        assert_eq!(state.metadata.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_headers_are_unauthorized() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(request("GET", "/ac/1", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Unauthorized");
    }

    #[tokio::test]
    async fn test_get_absent_key_is_not_found() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(request("GET", "/ac/missing", ALICE, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_routes_and_methods_are_not_found() {
        let state = test_state().await;
        for (method, uri) in [
            ("GET", "/"),
            ("GET", "/other/abc"),
            ("GET", "/ac/"),
            ("GET", "/credentials/alice"),
            ("DELETE", "/cas/abc"),
            ("POST", "/ac/abc"),
            ("HEAD", "/cas/abc"),
            ("POST", "/health"),
        ] {
            let response = app(state.clone())
                .oneshot(request(method, uri, ALICE, ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_unknown_route_checked_before_auth() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(request("GET", "/nope", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_put_is_rejected() {
        let mut config = Config::default();
        config.server.max_object_size = 3;
        let state = Arc::new(AppState::new(
            config,
            Arc::new(MemoryMetadataIndex::new()),
            Arc::new(MemoryBackend::new()),
        ));
        state.auth.provision("alice", "secret1").await.unwrap();

        let response = app(state)
            .oneshot(request("PUT", "/cas/big", ALICE, "too big"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_health_and_common_headers() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(request("GET", "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-request-id").unwrap().len(), 16);
        assert!(headers.contains_key("date"));
        assert_eq!(headers.get("server").unwrap(), "buildstash");
        assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_health_disabled_is_not_found() {
        let mut config = Config::default();
        config.observability.health_check = false;
        let state = Arc::new(AppState::new(
            config,
            Arc::new(MemoryMetadataIndex::new()),
            Arc::new(MemoryBackend::new()),
        ));
        let response = app(state)
            .oneshot(request("GET", "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_responses_carry_headers() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(request("GET", "/ac/x", None, ""))
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.headers().get("server").unwrap(), "buildstash");
    }
}
