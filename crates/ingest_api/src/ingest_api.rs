use crate::domain::{ActivityIngestionService, InsightQueryService};
use crate::http::{build_router, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct IngestApiConfig {
    pub host: String,
    pub port: u16,
}

/// The ingest boundary as a runnable module: the axum router over the
/// ingestion and query services, served until cancellation.
pub struct IngestApi {
    router: axum::Router,
    config: IngestApiConfig,
}

impl IngestApi {
    pub fn new(
        ingestion: Arc<ActivityIngestionService>,
        insights: Arc<InsightQueryService>,
        config: IngestApiConfig,
    ) -> Self {
        let router = build_router(AppState { ingestion, insights });
        Self { router, config }
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new(move |ctx| {
            Box::pin(async move {
                let addr = format!("{}:{}", self.config.host, self.config.port);
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                info!(addr = %addr, "ingest api listening");

                axum::serve(listener, self.router)
                    .with_graceful_shutdown(async move { ctx.cancelled().await })
                    .await?;

                info!("ingest api stopped");
                Ok(())
            })
        })
    }
}
