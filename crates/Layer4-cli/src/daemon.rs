//! `hive run` - the long-running control plane

use chrono::{Duration as ChronoDuration, Local, NaiveTime};
use hive_cron::{CronScheduler, TaskSink};
use hive_engine::{Engine, Signal};
use hive_foundation::{EventBus, HiveConfig, RuntimeKind, TracingSink};
use hive_task::{DockerRuntime, RuntimeAdapterFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(mut config: HiveConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    info!(data_dir = %config.data_dir.display(), "Starting hive");

    let events = Arc::new(EventBus::new());
    events.subscribe(Arc::new(TracingSink)).await;

    let docker = match DockerRuntime::connect() {
        Ok(docker) if docker.is_available().await => Some(docker),
        Ok(_) => {
            warn!("Docker daemon not responding");
            None
        }
        Err(e) => {
            warn!(error = %e, "Docker unavailable");
            None
        }
    };
    resolve_runtime(&mut config, docker.is_some())?;

    let mut factory = RuntimeAdapterFactory::new(config.clone());
    if let Some(docker) = docker {
        info!("Sandbox runtime enabled");
        factory = factory.with_containers(Arc::new(docker));
    }

    let engine = Arc::new(
        Engine::new(config.clone(), Arc::new(factory)).with_events(Arc::clone(&events)),
    );
    let cron = Arc::new(
        CronScheduler::new(
            &config.data_dir,
            Arc::clone(&engine) as Arc<dyn TaskSink>,
            config.cron.clone(),
        )
        .with_events(Arc::clone(&events)),
    );

    let shutdown = CancellationToken::new();
    let engine_task = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
    let cron_task = tokio::spawn(Arc::clone(&cron).run(shutdown.clone()));
    let day_task = tokio::spawn(day_boundaries(Arc::clone(&engine), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    let (engine_result, cron_result, day_result) = tokio::join!(engine_task, cron_task, day_task);
    for result in [engine_result, cron_result, day_result] {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    Ok(())
}

/// Pick the runtime auto-assigned tasks get.
///
/// The in-process runtime needs an execution collaborator, which only
/// embedders can provide; the binary runs every task sandboxed.
fn resolve_runtime(config: &mut HiveConfig, sandbox_available: bool) -> anyhow::Result<()> {
    if !sandbox_available {
        anyhow::bail!(
            "no task runtime available: Docker is not reachable and the in-process \
             runtime needs an embedded execution collaborator"
        );
    }
    if config.default_runtime != RuntimeKind::Sandbox {
        warn!(
            configured = %config.default_runtime,
            "In-process runtime has no collaborator in the daemon, assigning tasks to the sandbox"
        );
        config.default_runtime = RuntimeKind::Sandbox;
    }
    Ok(())
}

/// Send `DayBoundary` at every local midnight
async fn day_boundaries(engine: Arc<Engine>, shutdown: CancellationToken) {
    loop {
        let wait = until_next_midnight();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => engine.signal(Signal::DayBoundary),
        }
    }
}

fn until_next_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    tomorrow
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .map(|midnight| (midnight - now).to_std().unwrap_or_default())
        .unwrap_or(Duration::from_secs(3_600))
        .max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_assigns_sandbox() {
        let mut config = HiveConfig::default();
        assert_eq!(config.default_runtime, RuntimeKind::InProcess);

        resolve_runtime(&mut config, true).unwrap();
        assert_eq!(config.default_runtime, RuntimeKind::Sandbox);

        // explicit sandbox config is left alone
        resolve_runtime(&mut config, true).unwrap();
        assert_eq!(config.default_runtime, RuntimeKind::Sandbox);
    }

    #[test]
    fn test_no_runtime_fails_fast() {
        let mut config = HiveConfig::default();
        let err = resolve_runtime(&mut config, false).unwrap_err();
        assert!(err.to_string().contains("no task runtime available"));
    }

    #[test]
    fn test_next_midnight_within_a_day() {
        let wait = until_next_midnight();
        assert!(wait >= Duration::from_secs(1));
        assert!(wait <= Duration::from_secs(25 * 3_600));
    }
}
