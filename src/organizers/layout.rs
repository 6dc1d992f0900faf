use crate::core::models::{Phase, RunDirs};
use crate::utils::time::{sanitize_target, timestamp_slug};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// Create `<output>/<target>_<timestamp>/` with `raw/phaseN_*`, `tmp/` and
/// `report/`. A second run against the same target in the same second gets a
/// numeric suffix instead of sharing the directory.
pub fn prepare_run_dirs(output_dir: &Path, target: &str, started: DateTime<Utc>) -> Result<RunDirs> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let stem = format!("{}_{}", sanitize_target(target), timestamp_slug(started));
    let mut root = output_dir.join(&stem);
    let mut suffix = 2;
    while root.exists() {
        root = output_dir.join(format!("{stem}_{suffix}"));
        suffix += 1;
    }

    let dirs = RunDirs {
        raw: root.join("raw"),
        tmp: root.join("tmp"),
        report: root.clone(),
        root,
    };

    for dir in [&dirs.root, &dirs.raw, &dirs.tmp, &dirs.report] {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    }
    for phase in Phase::ALL {
        let dir = dirs.phase_raw(phase);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    }

    verify_writable(&dirs.root)?;
    tracing::debug!("Run directory prepared at {:?}", dirs.root);
    Ok(dirs)
}

/// Drop the scratch directory once every ToolRun is terminal.
pub fn cleanup_tmp(dirs: &RunDirs) {
    match fs::remove_dir_all(&dirs.tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!("Could not remove {:?}: {}", dirs.tmp, e),
    }
}

fn verify_writable(path: &Path) -> Result<()> {
    let test_file = path.join(".write_test");
    fs::write(&test_file, b"test")
        .with_context(|| format!("Directory not writable: {:?}", path))?;
    fs::remove_file(&test_file)
        .with_context(|| format!("Failed to remove test file: {:?}", test_file))?;
    Ok(())
}
