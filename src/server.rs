use {
    crate::{
        admission::AdmissionController,
        api::{
            self,
            ws,
        },
        cache::Cache,
        config::RunOptions,
        lifecycle,
        processor,
        queue::Queue,
        state::Store,
    },
    anyhow::{
        anyhow,
        Result,
    },
    axum::{
        extract::State,
        routing::get,
        Router,
    },
    axum_prometheus::metrics_exporter_prometheus::{
        PrometheusBuilder,
        PrometheusHandle,
    },
    futures::Future,
    sqlx::{
        migrate,
        postgres::PgPoolOptions,
    },
    std::sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    tokio::time::sleep,
    tokio_util::task::TaskTracker,
    uuid::Uuid,
};

// A static exit flag to indicate to running threads that we're shutting
// down. This is used to gracefully shut down the application.
pub(crate) static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);
pub const EXIT_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

async fn fault_tolerant_handler<F, Fut>(name: String, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
    Fut::Output: Send + 'static,
{
    loop {
        let res = tokio::spawn(f()).await;
        match res {
            Ok(result) => match result {
                Ok(_) => break, // This will happen on graceful shutdown
                Err(err) => {
                    tracing::error!("{} returned error: {:?}", name, err);
                    sleep(std::time::Duration::from_millis(500)).await;
                }
            },
            Err(err) => {
                tracing::error!("{} is panicked or canceled: {:?}", name, err);
                SHOULD_EXIT.store(true, Ordering::Release);
                break;
            }
        }
    }
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| anyhow!("Failed to set up metrics recorder: {:?}", err))
}

async fn metrics_handler(State(store): State<Arc<Store>>) -> String {
    store.metrics_recorder.render()
}

async fn start_metrics(run_options: RunOptions, store: Arc<Store>) -> Result<()> {
    let app: Router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(store);
    let listener = tokio::net::TcpListener::bind(&run_options.server.metrics_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            while !SHOULD_EXIT.load(Ordering::Acquire) {
                sleep(EXIT_CHECK_INTERVAL).await;
            }
            tracing::info!("Shutting down metrics server...");
        })
        .await?;
    Ok(())
}

pub async fn start_server(run_options: RunOptions) -> Result<()> {
    tokio::spawn(async move {
        tracing::info!("Registered shutdown signal handler...");
        tokio::signal::ctrl_c().await.unwrap();
        tracing::info!("Shut down signal received, waiting for tasks...");
        SHOULD_EXIT.store(true, Ordering::Release);
    });

    let pool = PgPoolOptions::new()
        .max_connections(run_options.server.database_max_connections)
        .min_connections(run_options.server.database_min_connections)
        .connect(&run_options.server.database_url)
        .await
        .expect("Server should start with a valid database connection.");
    migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|err| anyhow!("Failed to run migrations: {:?}", err))?;

    let cache = Cache::new(&run_options.server.redis_url).await?;
    cache.ping().await?;
    let queue = Queue::connect(
        &run_options.server.nats_url,
        run_options.processor.queue_prefetch,
    )
    .await;

    let worker_id = Uuid::new_v4();
    tracing::info!(%worker_id, queue_enabled = queue.is_enabled(), "Starting server.");

    let store = Arc::new(Store {
        repo:                Arc::new(pool),
        cache:               cache.clone(),
        queue,
        ws:                  ws::WsState::new(),
        admission:           AdmissionController::new(cache, run_options.admission.clone()),
        processor:           run_options.processor.clone(),
        secret_key:          run_options.secret_key.clone(),
        requester_ip_header: run_options.server.requester_ip_header_name.clone(),
        worker_id,
        task_tracker:        TaskTracker::new(),
        metrics_recorder:    setup_metrics_recorder()?,
    });

    tokio::join!(
        fault_tolerant_handler("bid consumer".to_string(), || processor::run_bid_consumer(
            store.clone()
        )),
        fault_tolerant_handler("event dispatcher".to_string(), || ws::run_event_dispatcher(
            store.clone()
        )),
        fault_tolerant_handler("subscription cleanup".to_string(), || {
            ws::run_subscription_cleanup(store.clone())
        }),
        fault_tolerant_handler("auction lifecycle".to_string(), || {
            lifecycle::run_lifecycle_loop(store.clone())
        }),
        fault_tolerant_handler("start api".to_string(), || api::start_api(
            run_options.clone(),
            store.clone()
        )),
        fault_tolerant_handler("start metrics".to_string(), || start_metrics(
            run_options.clone(),
            store.clone()
        )),
    );

    // Wait for the sockets still attached to the gateway to drain. Closing
    // the task tracker doesn't mean it won't accept new tasks.
    store.task_tracker.close();
    store.task_tracker.wait().await;

    Ok(())
}
