use std::sync::Arc;

use cloud_ocr::{
    app_state::AppState, config::AppConfig, services::ocr::CommandOcrEngine, telemetry,
    workers::recognition::RecognitionWorker,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    telemetry::init_logging();

    tracing::info!("Starting recognition worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        telemetry::install_worker_exporter(addr).expect("Failed to install Prometheus exporter");
    }

    let state = AppState::connect(&config)
        .await
        .expect("Failed to initialize pipeline services");

    tracing::info!(command = %config.ocr_command, "Using external OCR command");
    let ocr = CommandOcrEngine::new(&config.ocr_command, &config.ocr_args);

    let worker = RecognitionWorker::recognition(
        &state,
        Arc::new(ocr),
        config.recognition_settings(),
        config.ocr_timeout(),
    );

    let cancel = CancellationToken::new();
    telemetry::cancel_on_shutdown_signal(cancel.clone());

    worker.run(cancel).await;
}
