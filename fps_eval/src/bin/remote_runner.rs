use anyhow::Context;
use fps_eval::{app, config, remote_runner};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_configuration()?;
    let log_level = &format!("{},h2=info,tower=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    let runner = config
        .runner
        .as_ref()
        .context("the `runner` section is required")?;

    let mut session = app::connect(&config.devkit).await?;
    let result = remote_runner::run_remote(&mut session, runner).await;
    session.release().await;

    let output = result?;
    if output.timed_out {
        tracing::info!("Model command ran for its full run time");
    }
    Ok(())
}
