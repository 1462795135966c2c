#![deny(clippy::all, clippy::pedantic)]

mod config;
mod watcher;

use anyhow::{bail, Result};
use compute::{ComputeBackend, CpuBackend, Dispatcher, TriggerParams};
use config::{BackendChoice, RuntimeConfig};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn select_backend(choice: BackendChoice) -> Result<Arc<dyn ComputeBackend>> {
    match choice {
        BackendChoice::Auto => Ok(compute::default_backend()),
        BackendChoice::Cpu => Ok(Arc::new(CpuBackend::new())),
        #[cfg(feature = "gpu")]
        BackendChoice::Gpu => Ok(Arc::new(compute::WgpuBackend::try_new()?)),
        #[cfg(not(feature = "gpu"))]
        BackendChoice::Gpu => bail!("the gpu backend requires building with `--features gpu`"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RuntimeConfig::from_env()?;
    let registry = compute::startup(&config.shader_dir)?;
    let backend = select_backend(config.backend)?;
    tracing::info!(
        "{} kernel(s) registered; running on {} at {:?}",
        registry.kernels().count(),
        backend.name(),
        backend.feature_level()
    );

    let (reports_tx, reports_rx) = mpsc::channel();
    let dispatcher = Dispatcher::spawn(backend, &registry, config.dispatch.clone(), Some(reports_tx))?;

    let _shader_watcher = if config.watch_shaders {
        match watcher::start(&config.shader_dir, dispatcher.queue()) {
            Ok(watcher_instance) => Some(watcher_instance),
            Err(e) => {
                tracing::error!("Failed to start shader watcher: {e:?}");
                None
            }
        }
    } else {
        None
    };

    let params = TriggerParams::from(&config.dispatch);
    let interval = Duration::from_millis(config.trigger_interval_ms);
    for i in 0..config.triggers {
        if i > 0 && !interval.is_zero() {
            std::thread::sleep(interval);
        }
        dispatcher.trigger(params);
    }
    dispatcher.shutdown();

    let mut failures = 0usize;
    for report in reports_rx.try_iter() {
        match report.outcome {
            Ok(Some(values)) => tracing::info!(
                "Dispatch {} ({:?} groups): {} value(s) read back",
                report.sequence,
                report.group_count,
                values.len()
            ),
            Ok(None) => tracing::info!("Dispatch {} ({:?} groups) submitted", report.sequence, report.group_count),
            Err(e) => {
                failures += 1;
                tracing::error!("Dispatch {} failed: {e}", report.sequence);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} dispatch(es) failed", config.triggers);
    }
    Ok(())
}
