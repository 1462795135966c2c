use anyhow::Result;
use compute::WorkQueue;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::Path;
use tracing::info;

fn is_shader(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "wgsl")
}

/// Watches `shader_dir` and asks the submission thread to rebuild pipelines
/// whenever a `.wgsl` file is created or modified.
pub fn start(shader_dir: &Path, queue: WorkQueue) -> Result<RecommendedWatcher> {
    info!("Initializing shader watcher...");

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if (event.kind.is_modify() || event.kind.is_create()) && event.paths.iter().any(|p| is_shader(p)) {
                for path in event.paths.iter().filter(|p| is_shader(p)) {
                    info!("Shader changed: {}", path.display());
                }
                queue.reload_shaders();
            }
        }
        Err(e) => tracing::error!("Error watching shader files: {e:?}"),
    })?;

    watcher.watch(shader_dir, RecursiveMode::Recursive)?;
    info!("Shader watcher started for {}", shader_dir.display());
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::is_shader;
    use std::path::Path;

    #[test]
    fn only_wgsl_files_trigger_reloads() {
        assert!(is_shader(Path::new("shaders/Private/TestCompute.wgsl")));
        assert!(!is_shader(Path::new("shaders/Private/TestCompute.wgsl.swp")));
        assert!(!is_shader(Path::new("shaders/README")));
    }
}
