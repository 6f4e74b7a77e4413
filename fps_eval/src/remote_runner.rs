use crate::config::RunnerConfig;
use mla_client::{RemoteSession, ScriptOutput, SessionError};
use std::time::Duration;

const DEFAULT_RUN_TIME_SECS: u64 = 60;

/// Drops a leading interpreter and makes sure `--run_args` follows the
/// script name. Returns the command as a single shell line.
pub fn normalise_command(command: &str) -> Vec<String> {
    let mut words: Vec<&str> = command.split_whitespace().collect();
    if matches!(words.first(), Some(&"python") | Some(&"python3")) {
        words.remove(0);
    }
    let line = words.join(" ");
    if line.contains("--run_args") || words.is_empty() {
        return vec![line];
    }
    words.insert(1, "--run_args");
    vec![words.join(" ")]
}

pub fn run_time(config: &RunnerConfig) -> Duration {
    match config.run_time_secs {
        0 => {
            tracing::info!("run_time is 0, overriding it to {} seconds", DEFAULT_RUN_TIME_SECS);
            Duration::from_secs(DEFAULT_RUN_TIME_SECS)
        }
        secs => Duration::from_secs(secs),
    }
}

/// Runs the model command inside a fresh virtual environment on the device
/// and removes the environment afterwards.
pub async fn run_remote(
    session: &mut RemoteSession,
    config: &RunnerConfig,
) -> Result<ScriptOutput, SessionError> {
    session.create_virtual_env(&config.virtual_env).await?;
    tracing::info!("Created virtual environment {}", config.virtual_env);

    let command = normalise_command(&config.model_command);
    tracing::info!("Running {:?} on {}", command, session.endpoint());
    let result = session
        .run_remote_script(
            command,
            &config.model_archive,
            run_time(config),
            &config.virtual_env,
        )
        .await;

    if let Ok(output) = &result {
        tracing::info!("stdout: {}", output.stdout);
        // A run bounded by its timeout always ends this way.
        if !output.stderr.contains("Command timed out") {
            tracing::info!("returncode: {}", output.status);
            tracing::warn!("stderr: {}", output.stderr);
        }
    }

    let deleted = session.delete_virtual_env(&config.virtual_env).await;
    let output = result?;
    deleted?;
    Ok(output)
}
