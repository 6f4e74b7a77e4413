use crate::config::{Config, DetectionConfig, DevkitConfig, ModelConfig};
use crate::inference::{EvalError, EvalPlan, Evaluator};
use crate::stats::SessionStats;

use anyhow::Context;
use mla_client::{GrpcLink, RemoteSession};
use std::{future::Future, time::Duration};
use tokio::signal;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalSummary {
    pub cycles: u64,
    pub frames: u64,
    pub elapsed: Duration,
}

impl EvalSummary {
    pub fn fps(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.frames as f64 / seconds
        } else {
            0.0
        }
    }
}

pub async fn connect(devkit: &DevkitConfig) -> anyhow::Result<RemoteSession> {
    let link = GrpcLink::new(devkit.host.clone(), devkit.port)
        .with_bulk_port(devkit.bulk_port)
        .with_connect_timeout(Duration::from_secs(devkit.connect_timeout_secs));
    match RemoteSession::connect(link).await {
        Ok(session) => Ok(session),
        Err(e) => {
            tracing::error!("Failed to connect to {}: {}", devkit.get_address(), e);
            Err(e.into())
        }
    }
}

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let model = config
        .model
        .as_ref()
        .context("the `model` section is required")?;
    model.validate().map_err(anyhow::Error::msg)?;

    // Manifest problems surface before the device is touched.
    let plan = EvalPlan::from_config(model)?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let session = tokio::select! {
        biased;
        _ = &mut shutdown => {
            tracing::info!("Shutdown signal received before connecting.");
            return Ok(());
        }
        session = connect(&config.devkit) => session?,
    };

    let summary = run(session, model, &config.detection, plan, shutdown).await?;
    tracing::info!(
        "Evaluated {} frames in {} cycles: {:.2} FPS",
        summary.frames,
        summary.cycles,
        summary.fps()
    );
    Ok(())
}

/// Opens the evaluator and drives it until it is done or `shutdown`
/// resolves. A signal during setup lets setup finish so every handle it
/// created is released.
pub async fn run(
    session: RemoteSession,
    model: &ModelConfig,
    detection: &DetectionConfig,
    plan: EvalPlan,
    shutdown: impl Future<Output = ()>,
) -> Result<EvalSummary, EvalError> {
    tokio::pin!(shutdown);
    let open = Evaluator::open(session, model, detection, plan);
    tokio::pin!(open);

    let opened = tokio::select! {
        biased;
        _ = &mut shutdown => None,
        evaluator = &mut open => Some(evaluator),
    };
    let mut evaluator = match opened {
        Some(evaluator) => evaluator?,
        None => {
            tracing::info!("Shutdown signal received during setup, releasing the device.");
            let mut evaluator = open.await?;
            evaluator.release().await;
            return Ok(EvalSummary::default());
        }
    };

    let result = evaluate(
        &mut evaluator,
        model.max_frames,
        Evaluator::single_shot(model),
        shutdown,
    )
    .await;
    evaluator.release().await;
    result
}

/// Runs cycles until `max_cycles` (zero for no limit), a single shot, or
/// `shutdown` resolves.
pub async fn evaluate(
    evaluator: &mut Evaluator,
    max_cycles: u64,
    single_shot: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<EvalSummary, EvalError> {
    tokio::pin!(shutdown);
    let mut stats = SessionStats::default();
    let mut summary = EvalSummary::default();

    loop {
        let cycle = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, stopping evaluation.");
                break;
            }
            cycle = evaluator.cycle() => cycle,
        };
        let cycle = match cycle {
            Ok(cycle) => cycle,
            Err(e) => {
                tracing::error!("Evaluation cycle failed: {}", e);
                return Err(e);
            }
        };

        summary.cycles += 1;
        summary.frames += cycle.frames;
        summary.elapsed += cycle.elapsed;
        if let Some(count) = cycle.detections {
            tracing::debug!("Cycle {}: {} detections", summary.cycles, count);
        }

        let (next, report) = stats.record(cycle.frames, cycle.elapsed);
        stats = next;
        if let Some(report) = report {
            tracing::info!(
                "FPS: {:.2} ({} frames in {:?}, {} total)",
                report.fps,
                report.frames,
                report.elapsed,
                stats.total_frames()
            );
        }

        if single_shot || (max_cycles > 0 && summary.cycles >= max_cycles) {
            break;
        }
    }
    Ok(summary)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvalMode, LogLevel, TransferSetting};
    use mla_client::LoopbackDevice;
    use std::net::TcpListener;

    const TWO_MLA_MANIFEST: &str = r#"{
        "plugins": [
            {"processor": "MLA", "config_params": {"kernel": "mla"},
             "input_nodes": [{"name": "frame", "size": 16}],
             "output_nodes": [{"name": "hidden", "size": 16}]},
            {"processor": "MLA", "config_params": {"kernel": "mla"},
             "input_nodes": [{"name": "hidden", "size": 16}],
             "output_nodes": [{"name": "ofm", "size": 8}]}
        ]
    }"#;

    fn pipelined() -> ModelConfig {
        ModelConfig {
            model_file: "yolox_mpk.tar.gz".into(),
            mpk_manifest: None,
            mode: None,
            batch_size: 1,
            max_frames: 0,
            layer_stats: None,
            transfer: TransferSetting::Bulk,
            image_size: vec![4, 4, 3],
        }
    }

    async fn evaluator(device: &LoopbackDevice, config: &ModelConfig) -> Evaluator {
        let session = RemoteSession::connect(device.clone()).await.unwrap();
        let plan = EvalPlan::from_config(config).unwrap();
        Evaluator::open(session, config, &DetectionConfig::default(), plan)
            .await
            .unwrap()
    }

    /// Host and port with nothing listening.
    fn closed_devkit() -> DevkitConfig {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        DevkitConfig {
            host: "127.0.0.1".into(),
            port,
            bulk_port: port,
            connect_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_bad_manifest_fails_before_connecting() {
        let path = std::env::temp_dir().join(format!("two_mla_{}.json", std::process::id()));
        std::fs::write(&path, TWO_MLA_MANIFEST).unwrap();
        let mut model = pipelined();
        model.model_file = "build/model.elf".into();
        model.mode = Some(EvalMode::Prepost);
        model.mpk_manifest = Some(path.clone());
        let config = Config {
            log_level: LogLevel::Info,
            devkit: closed_devkit(),
            model: Some(model),
            detection: DetectionConfig::default(),
            runner: None,
        };

        let error = start_app(config).await.unwrap_err();
        std::fs::remove_file(&path).unwrap();

        assert!(error.to_string().contains("MLA nodes"), "{}", error);
        let error = error.downcast::<EvalError>().unwrap();
        assert_eq!(error.kind(), mla_client::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_shutdown_during_setup_releases_the_device() {
        let device = LoopbackDevice::new();
        let config = pipelined();
        let session = RemoteSession::connect(device.clone()).await.unwrap();
        let plan = EvalPlan::from_config(&config).unwrap();

        let summary = run(session, &config, &DetectionConfig::default(), plan, async {})
            .await
            .unwrap();

        assert_eq!(summary, EvalSummary::default());
        assert_eq!(device.calls_to("pm_connect"), 1);
        assert_eq!(device.calls_to("run_pipeline"), 0);
        assert_eq!(device.calls_to("pipeline_free_model"), 1);
    }

    #[tokio::test]
    async fn test_run_evaluates_until_max_cycles() {
        let device = LoopbackDevice::new();
        let mut config = pipelined();
        config.max_frames = 3;
        let session = RemoteSession::connect(device.clone()).await.unwrap();
        let plan = EvalPlan::from_config(&config).unwrap();

        let summary = run(
            session,
            &config,
            &DetectionConfig::default(),
            plan,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(summary.cycles, 3);
        assert_eq!(device.calls_to("pipeline_free_model"), 1);
    }

    #[tokio::test]
    async fn test_stops_after_max_cycles() {
        let device = LoopbackDevice::new();
        let config = pipelined();
        let mut evaluator = evaluator(&device, &config).await;

        let summary = evaluate(&mut evaluator, 12, false, std::future::pending())
            .await
            .unwrap();
        evaluator.release().await;

        assert_eq!(summary.cycles, 12);
        assert_eq!(summary.frames, 12);
        assert_eq!(device.calls_to("run_pipeline"), 12);
        assert_eq!(device.calls_to("pipeline_free_model"), 1);
    }

    #[tokio::test]
    async fn test_single_shot_runs_once() {
        let device = LoopbackDevice::new();
        let config = pipelined();
        let mut evaluator = evaluator(&device, &config).await;

        let summary = evaluate(&mut evaluator, 0, true, std::future::pending())
            .await
            .unwrap();
        assert_eq!(summary.cycles, 1);
        evaluator.release().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_any_cycle() {
        let device = LoopbackDevice::new();
        let config = pipelined();
        let mut evaluator = evaluator(&device, &config).await;

        let summary = evaluate(&mut evaluator, 0, false, async {}).await.unwrap();
        evaluator.release().await;

        assert_eq!(summary, EvalSummary::default());
        assert_eq!(device.calls_to("run_pipeline"), 0);
    }

    #[tokio::test]
    async fn test_cycle_error_is_returned() {
        let device = LoopbackDevice::new();
        let config = pipelined();
        let mut evaluator = evaluator(&device, &config).await;
        device.disconnect();

        let error = evaluate(&mut evaluator, 0, false, std::future::pending())
            .await
            .unwrap_err();
        evaluator.release().await;

        assert_eq!(error.kind(), mla_client::ErrorKind::Transport);
    }

    #[test]
    fn test_summary_fps() {
        let summary = EvalSummary {
            cycles: 5,
            frames: 10,
            elapsed: Duration::from_secs(4),
        };
        assert_eq!(summary.fps(), 2.5);
        assert_eq!(EvalSummary::default().fps(), 0.0);
    }
}
