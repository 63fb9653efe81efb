//! One-shot startup task execution.
//!
//! Tasks run in declared order before any service starts; any failure is
//! fatal. `exec` and `template` tasks are suppressed on later boots by a
//! zero-byte marker named after the task's identity key, unless the task
//! sets `every-start`. Tree creation is itself idempotent and carries no
//! marker.

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use std::path::Path;
use tracing::info;

use crate::child::{self, ChildSpec};
use crate::config::{ExecTask, StartupTask};
use crate::identity;
use crate::output::OutputSink;
use crate::template;
use crate::tree;

/// Run every startup task in order. The first failure aborts the sequence.
pub fn run_all(
    tasks: &[StartupTask],
    state_dir: &Path,
    sink: &OutputSink,
    defaults: &IndexMap<String, String>,
) -> Result<()> {
    for task in tasks {
        run_task(task, state_dir, sink, defaults)
            .with_context(|| format!("startup task '{}'", task.description()))?;
    }
    Ok(())
}

fn run_task(
    task: &StartupTask,
    state_dir: &Path,
    sink: &OutputSink,
    defaults: &IndexMap<String, String>,
) -> Result<()> {
    match task {
        StartupTask::Tree(tree_task) => {
            info!("Creating directory tree: {}", tree_task.description);
            tree::ensure(Path::new("/"), &tree_task.tree)
        }
        StartupTask::Exec(exec_task) => with_marker(task, exec_task.every_start, state_dir, || {
            run_exec(exec_task, sink)
        }),
        StartupTask::Template(template_task) => {
            with_marker(task, template_task.every_start, state_dir, || {
                info!("Rendering template: {}", template_task.description);
                template::fill(template_task, defaults)
            })
        }
    }
}

/// Run `action` unless a marker for this task already exists; write the
/// marker after success. `every-start` tasks run unconditionally but still
/// refresh their marker.
fn with_marker(
    task: &StartupTask,
    every_start: bool,
    state_dir: &Path,
    action: impl FnOnce() -> Result<()>,
) -> Result<()> {
    let key = identity::identity_key(task)?;
    let marker = state_dir.join(&key);
    if !every_start && marker.exists() {
        info!("Skipping startup task: {}", task.description());
        return Ok(());
    }
    action()?;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("create startup state directory {}", state_dir.display()))?;
    std::fs::write(&marker, "")
        .with_context(|| format!("write startup marker {}", marker.display()))?;
    Ok(())
}

/// Run an `exec` task to completion, streaming its output through the sink
/// under the task description. A non-zero exit is fatal.
fn run_exec(task: &ExecTask, sink: &OutputSink) -> Result<()> {
    info!("Running startup task: {}", task.description);
    let (mut child, reader) = child::spawn(&ChildSpec::from(task))?;
    let pump = reader.map(|r| child::spawn_pump(r, sink.clone(), task.description.clone()));
    let status = child.wait()?;
    if let Some(pump) = pump {
        let _ = pump.join();
    }
    if !status.success() {
        bail!("exited with {status}");
    }
    Ok(())
}
