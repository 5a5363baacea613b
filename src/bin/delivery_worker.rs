use std::sync::Arc;

use cloud_ocr::{
    app_state::AppState, config::AppConfig, services::email::HttpEmailClient, telemetry,
    workers::delivery::DeliveryWorker,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    telemetry::init_logging();

    tracing::info!("Starting delivery worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let api_key = config
        .email_api_key
        .as_deref()
        .expect("EMAIL_API_KEY must be set for the delivery worker");

    if let Some(addr) = &config.metrics_addr {
        telemetry::install_worker_exporter(addr).expect("Failed to install Prometheus exporter");
    }

    let state = AppState::connect(&config)
        .await
        .expect("Failed to initialize pipeline services");

    tracing::info!(api_url = %config.email_api_url, "Initializing email client");
    let email = HttpEmailClient::new(
        &config.email_api_url,
        api_key,
        &config.email_from_address,
        &config.email_from_name,
    );

    let worker = DeliveryWorker::delivery(&state, Arc::new(email), config.delivery_settings());

    let cancel = CancellationToken::new();
    telemetry::cancel_on_shutdown_signal(cancel.clone());

    worker.run(cancel).await;
}
