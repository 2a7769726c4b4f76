//! Health and metrics endpoints.
//!
//! `/health` folds per-dependency statuses maintained by the supervisor's
//! probe task into an overall `OK`/`UNAVAILABLE` with a matching 200/503;
//! `/metrics` renders the Prometheus registry in text exposition format.

use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::metrics::gather_text;

/// Health of a single dependency
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.into()),
        }
    }

    /// For optional dependencies that are not configured (e.g. the cache)
    pub fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
            message: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == "healthy" || self.status == "disabled"
    }
}

/// Mutable view of dependency health, written by the supervisor's probe
/// task and read by the endpoint.
#[derive(Default)]
pub struct HealthRegistry {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, component: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(component.to_string(), health);
    }

    pub async fn snapshot(&self) -> HashMap<String, ComponentHealth> {
        self.components.read().await.clone()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    dependencies: HashMap<String, ComponentHealth>,
}

async fn health_check(registry: web::Data<Arc<HealthRegistry>>) -> HttpResponse {
    let dependencies = registry.snapshot().await;
    let all_available = !dependencies.is_empty()
        && dependencies.values().all(ComponentHealth::is_available);

    if all_available {
        HttpResponse::Ok().json(HealthResponse {
            status: "OK".to_string(),
            dependencies,
        })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "UNAVAILABLE".to_string(),
            dependencies,
        })
    }
}

async fn metrics_endpoint() -> HttpResponse {
    match gather_text() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(body),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)));
    cfg.service(web::resource("/metrics").route(web::get().to(metrics_endpoint)));
}

/// Build the observability HTTP server. Binding errors are startup-fatal;
/// the caller spawns the returned server as a task.
pub fn serve(
    port: u16,
    registry: Arc<HealthRegistry>,
) -> std::io::Result<actix_web::dev::Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .configure(routes)
    })
    .bind(("0.0.0.0", port))?
    .workers(1)
    .disable_signals()
    .run();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[tokio::test]
    async fn empty_registry_reports_unavailable() {
        let registry = Arc::new(HealthRegistry::new());
        let response = health_check(web::Data::new(registry)).await;
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn all_available_reports_ok() {
        let registry = Arc::new(HealthRegistry::new());
        registry.set("database", ComponentHealth::healthy()).await;
        registry.set("cache", ComponentHealth::disabled()).await;
        registry.set("broker", ComponentHealth::healthy()).await;

        let response = health_check(web::Data::new(registry)).await;
        assert_eq!(response.status(), 200);

        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "OK");
        assert_eq!(parsed["dependencies"]["database"]["status"], "healthy");
    }

    #[tokio::test]
    async fn one_unhealthy_dependency_degrades_the_whole() {
        let registry = Arc::new(HealthRegistry::new());
        registry.set("database", ComponentHealth::healthy()).await;
        registry
            .set("broker", ComponentHealth::unhealthy("connection refused"))
            .await;

        let response = health_check(web::Data::new(registry)).await;
        assert_eq!(response.status(), 503);

        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "UNAVAILABLE");
        assert_eq!(
            parsed["dependencies"]["broker"]["message"],
            "connection refused"
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_exposition() {
        let _ = super::super::metrics::init_metrics();
        let response = metrics_endpoint().await;
        assert_eq!(response.status(), 200);
        let headers = response.headers().clone();
        let content_type = headers.get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
