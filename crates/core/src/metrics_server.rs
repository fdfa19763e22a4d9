//! Metrics HTTP server
//!
//! Serves the current [`MetricsSnapshot`] as JSON on `GET /metrics` for dashboards
//! and scripts watching a long batch run.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve metrics on `addr` until the task is dropped or the listener fails
pub async fn run_metrics_server(metrics: SharedMetrics, addr: SocketAddr) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Metrics server listening");

    axum::serve(listener, create_metrics_router(metrics)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_metrics, SystemMetrics, WorkerMetrics};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        {
            let mut snapshot = metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.queue_len = 5;
            snapshot.running_jobs = 1;
            snapshot.completed_jobs = 42;
            snapshot.failed_jobs = 2;
            snapshot.skipped_jobs = 3;
            snapshot.system = SystemMetrics {
                cpu_usage_percent: 85.2,
                mem_usage_percent: 42.1,
                load_avg_1: 7.5,
                load_avg_5: 6.8,
                load_avg_15: 5.2,
            };
            snapshot.workers.push(WorkerMetrics {
                id: 7,
                source: "/music/album/01 - intro.flac".to_string(),
                percent: 45.0,
                elapsed_secs: 12.0,
                eta_secs: 14.7,
                speed: "12.3x".to_string(),
            });
        }

        let response = create_metrics_router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: MetricsSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to MetricsSnapshot");

        assert_eq!(snapshot.queue_len, 5);
        assert_eq!(snapshot.completed_jobs, 42);
        assert_eq!(snapshot.skipped_jobs, 3);
        assert_eq!(snapshot.workers.len(), 1);
        assert_eq!(snapshot.workers[0].id, 7);
        assert_eq!(snapshot.workers[0].speed, "12.3x");
    }

    #[tokio::test]
    async fn test_metrics_json_field_names() {
        let response = create_metrics_router(new_shared_metrics())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        for field in [
            "timestamp_unix_ms",
            "workers",
            "system",
            "queue_len",
            "running_jobs",
            "completed_jobs",
            "failed_jobs",
            "skipped_jobs",
            "stopped_jobs",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["system"]["cpu_usage_percent"], 0.0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = create_metrics_router(new_shared_metrics())
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
