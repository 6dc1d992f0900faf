use super::writer::{RESULTS_FILE, SUMMARY_FILE};
use crate::core::models::RunDirs;
use crate::core::state::RunReport;
use anyhow::{Context, Result, bail};
use std::fs;

/// Both artifacts exist, are non-empty, and `results.json` reads back as a
/// complete [`RunReport`].
pub fn validate_reports(dirs: &RunDirs) -> Result<()> {
    for name in [RESULTS_FILE, SUMMARY_FILE] {
        let file = dirs.report.join(name);
        if !file.exists() {
            bail!("Required report file missing: {:?}", file);
        }
        let metadata = fs::metadata(&file)?;
        if metadata.len() == 0 {
            bail!("Report file is empty: {:?}", file);
        }
    }

    let results = dirs.report.join(RESULTS_FILE);
    let text = fs::read_to_string(&results)?;
    let report: RunReport = serde_json::from_str(&text)
        .with_context(|| format!("{:?} is not a valid run report", results))?;

    tracing::info!(
        "Reports validated: {} phases, {} issues",
        report.phases.len(),
        report.issues.len()
    );
    Ok(())
}
