use {
    crate::{
        admission::AdmissionController,
        api::ws::WsState,
        cache::Cache,
        processor,
        queue::Queue,
        repository::Database,
    },
    axum_prometheus::metrics_exporter_prometheus::PrometheusHandle,
    std::sync::Arc,
    tokio_util::task::TaskTracker,
    uuid::Uuid,
};

/// Process-wide state shared by the gateway, the processor and the
/// lifecycle loops. Subsystem singletons live here rather than in library
/// globals; init and teardown are tied to server start and stop.
pub struct Store {
    pub repo:                Arc<dyn Database>,
    pub cache:               Cache,
    pub queue:               Queue,
    pub ws:                  WsState,
    pub admission:           AdmissionController,
    pub processor:           processor::Options,
    pub secret_key:          String,
    pub requester_ip_header: String,
    /// Identifies this instance as a lock holder.
    pub worker_id:           Uuid,
    pub task_tracker:        TaskTracker,
    pub metrics_recorder:    PrometheusHandle,
}
