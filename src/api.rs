use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::container::Container;
use crate::manager::TracerManager;

async fn healthz(State(manager): State<Arc<TracerManager>>) -> Response {
    if manager.is_closed() {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "closed").into_response();
    }
    (axum::http::StatusCode::OK, "ok").into_response()
}

async fn dump(State(manager): State<Arc<TracerManager>>) -> String {
    manager.dump_state()
}

async fn containers(State(manager): State<Arc<TracerManager>>) -> Json<Vec<Container>> {
    let containers = manager
        .list_containers()
        .iter()
        .map(|c| c.as_ref().clone())
        .collect();
    Json(containers)
}

/// Debug HTTP endpoint exposing the manager's state.
pub struct APIServer {
    router: axum::Router,
}

impl APIServer {
    pub fn new(manager: Arc<TracerManager>) -> Self {
        let router = axum::Router::new()
            .route("/healthz", get(healthz))
            .route("/dump", get(dump))
            .route("/containers", get(containers))
            .with_state(manager);
        Self { router }
    }

    pub async fn listen(
        self,
        addr: impl ToSocketAddrs,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("Debug API listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::container::ContainerID;

    async fn get_body(router: axum::Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_routes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TracerManager::builder()
            .set_pin_path(dir.path().join("gadget"))
            .build()
            .unwrap();
        let mut c = Container::new(ContainerID::new("abc").unwrap(), 0);
        c.mntns = 42;
        c.name = "nginx".to_owned();
        manager.add_container(c).await.unwrap();

        let router = APIServer::new(Arc::clone(&manager)).router;
        let (status, body) = get_body(router.clone(), "/healthz").await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "ok"));

        let (status, body) = get_body(router.clone(), "/dump").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("abc pid=0 mntns=42"));

        let (status, body) = get_body(router.clone(), "/containers").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["id"], "abc");
        assert_eq!(json[0]["mntns"], 42);

        manager.close();
        let (status, _) = get_body(router, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
