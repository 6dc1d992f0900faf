use crate::core::findings::Finding;
use crate::core::models::RunDirs;
use crate::core::state::{PhaseStatus, RunReport, RunStatus};
use colored::*;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};

fn phase_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Phase").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Findings").add_attribute(Attribute::Bold),
            Cell::new("Tools").add_attribute(Attribute::Bold),
            Cell::new("Notes").add_attribute(Attribute::Bold),
        ]);

    for result in &report.phases {
        let (label, color) = match result.status {
            PhaseStatus::Completed => ("completed", Color::Green),
            PhaseStatus::Partial => ("partial", Color::Yellow),
            PhaseStatus::Skipped => ("skipped", Color::Yellow),
            PhaseStatus::Aborted => ("aborted", Color::Red),
            PhaseStatus::NotStarted => ("not started", Color::DarkGrey),
            PhaseStatus::Running => ("running", Color::Blue),
        };
        let visible = result.visible_findings().count();
        let hidden = result.len() - visible;
        let findings = if hidden > 0 {
            format!("{visible} (+{hidden} wildcard)")
        } else {
            visible.to_string()
        };

        let mut notes = Vec::new();
        if !result.tools_failed.is_empty() {
            notes.push(format!(
                "failed: {}",
                result.tools_failed.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if !result.incomplete_tools.is_empty() {
            notes.push(format!(
                "incomplete: {}",
                result.incomplete_tools.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if !result.tools_skipped.is_empty() {
            notes.push(format!(
                "skipped: {}",
                result.tools_skipped.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }

        table.add_row(vec![
            Cell::new(result.phase.to_string()),
            Cell::new(label).fg(color),
            Cell::new(findings),
            Cell::new(result.tools_run.iter().cloned().collect::<Vec<_>>().join(", ")),
            Cell::new(notes.join("\n")),
        ]);
    }
    table
}

fn count_visible(report: &RunReport, pick: fn(&Finding) -> bool) -> usize {
    report
        .phases
        .iter()
        .flat_map(|result| result.visible_findings())
        .filter(|finding| pick(finding))
        .count()
}

pub fn print_summary(report: &RunReport, dirs: &RunDirs) {
    let (title, color) = match report.status {
        RunStatus::Completed => ("Run complete", "green"),
        RunStatus::Partial => ("Run complete (partial results)", "yellow"),
        RunStatus::Aborted => ("Run aborted", "red"),
        RunStatus::Running => ("Run in progress", "blue"),
    };
    let rule = "═══════════════════════════════════════";
    println!("\n{}", rule.color(color).bold());
    println!("{}", title.color(color).bold());
    println!("{}", rule.color(color).bold());

    println!("\n{}: {}", "Target".cyan().bold(), report.target);
    println!("{}: {}", "Run ID".cyan().bold(), report.run_id);
    let waf = if !report.waf.probed {
        "not probed".dimmed()
    } else if report.waf.detected {
        format!("detected ({})", report.waf.vendor.as_deref().unwrap_or("unknown vendor")).red()
    } else {
        "none detected".green()
    };
    println!("{}: {}", "WAF".cyan().bold(), waf);

    println!("\n{}", phase_table(report));

    println!("\n{}", "Results:".yellow().bold());
    let rows = [
        ("Technologies", count_visible(report, |f| matches!(f, Finding::Technology(_)))),
        ("Subdomains", count_visible(report, |f| matches!(f, Finding::Subdomain(_)))),
        ("Open ports", count_visible(report, |f| matches!(f, Finding::Port(_)))),
        ("Paths", count_visible(report, |f| matches!(f, Finding::Path(_)))),
        ("Crawled URLs", count_visible(report, |f| matches!(f, Finding::Crawl(_)))),
    ];
    for (label, count) in rows {
        println!("  {}: {}", label, count.to_string().green().bold());
    }

    if report.policy_history.len() > 1 {
        println!("\n{}", "Policy changes:".yellow().bold());
        for change in report.policy_history.iter().skip(1) {
            println!("  r{} {}", change.revision, change.reason);
        }
    }

    if !report.missing_tools.is_empty() {
        println!(
            "\n{}: {}",
            "Missing tools".red().bold(),
            report.missing_tools.join(", ")
        );
    }
    if !report.issues.is_empty() {
        println!(
            "{}: {} (see summary.md)",
            "Issues".red().bold(),
            report.issues.len()
        );
    }

    println!(
        "\n{}",
        format!("Reports written to {}", dirs.report.display()).green().dimmed()
    );
}
