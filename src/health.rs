//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for reconciliation metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-kind reconciliation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for master resolution outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ResolutionLabels {
    pub namespace: String,
    pub name: String,
    /// "resolved" or "unresolved"
    pub result: String,
}

impl EncodeLabelSet for ResolutionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("result", self.result.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<KindLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<KindLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,
    /// Master resolutions by outcome
    pub master_resolutions_total: Family<ResolutionLabels, Counter>,
    /// Volume claims resized
    pub volume_resizes_total: Family<ReconcileLabels, Counter>,
    /// Desired replicas per resource
    pub resource_replicas_desired: Family<KindLabels, Gauge>,
    /// Ready replicas per resource
    pub resource_replicas_ready: Family<KindLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("redis_operator");

        let reconciliations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let master_resolutions_total = Family::<ResolutionLabels, Counter>::default();
        registry.register(
            "master_resolutions",
            "Master resolution attempts by outcome",
            master_resolutions_total.clone(),
        );

        let volume_resizes_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "volume_resizes",
            "Number of volume claims resized",
            volume_resizes_total.clone(),
        );

        let resource_replicas_desired = Family::<KindLabels, Gauge>::default();
        registry.register(
            "resource_replicas_desired",
            "Desired number of replicas for each resource",
            resource_replicas_desired.clone(),
        );

        let resource_replicas_ready = Family::<KindLabels, Gauge>::default();
        registry.register(
            "resource_replicas_ready",
            "Number of ready replicas for each resource",
            resource_replicas_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            master_resolutions_total,
            volume_resizes_total,
            resource_replicas_desired,
            resource_replicas_ready,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, duration_secs: f64) {
        let labels = kind_labels(kind, namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: &str, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&kind_labels(kind, namespace, name))
            .inc();
    }

    /// Record the outcome of a master resolution
    pub fn record_master_resolution(&self, namespace: &str, name: &str, resolved: bool) {
        let labels = ResolutionLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            result: if resolved { "resolved" } else { "unresolved" }.to_string(),
        };
        self.master_resolutions_total.get_or_create(&labels).inc();
    }

    /// Record resized volume claims of a workload
    pub fn record_volume_resizes(&self, namespace: &str, name: &str, count: usize) {
        if count == 0 {
            return;
        }
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.volume_resizes_total
            .get_or_create(&labels)
            .inc_by(count as u64);
    }

    /// Update resource replica metrics
    pub fn set_resource_replicas(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        desired: i64,
        ready: i64,
    ) {
        let labels = kind_labels(kind, namespace, name);
        self.resource_replicas_desired
            .get_or_create(&labels)
            .set(desired);
        self.resource_replicas_ready
            .get_or_create(&labels)
            .set(ready);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

fn kind_labels(kind: &str, namespace: &str, name: &str) -> KindLabels {
    KindLabels {
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controllers)
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness: answering at all is enough.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness: 503 until leadership is held and the controllers run.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0 on `port` and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
