//! Run summary rendering for the run command.
//!
//! Output contracts:
//! - JSON mode: the serialized report on stdout, build output and logs on stderr
//! - Text mode: build output then this summary on stdout, logs on stderr

use codebuild_local_core::build::RunReport;
use codebuild_local_core::executor::PhaseResult;
use console::style;

/// Render `report` as a human-readable block
///
/// ```text
/// Build local-1a2b3c4d5e6f: SUCCEEDED in 12.4s
///   [OK] install (exit 0)
///   [X] build (exit 2): `make` failed
///   [OK] post_build (exit 0) [finalization]
/// Artifacts: 3 files (1.2 KiB)
/// ```
pub fn render_text(report: &RunReport) -> String {
    let mut output = String::new();

    let state = if report.cancelled {
        style("CANCELLED".to_string()).yellow().bold()
    } else if report.succeeded() {
        style(report.state.to_string()).green().bold()
    } else {
        style(report.state.to_string()).red().bold()
    };
    output.push_str(&format!(
        "{} {}: {} in {:.1}s\n",
        style("Build").bold(),
        report.build_id,
        state,
        report.duration.as_secs_f64()
    ));

    for result in &report.phases {
        output.push_str(&format!("  {}\n", render_phase(result, report.cancelled)));
    }
    if report.phases.is_empty() {
        output.push_str(&format!("  {}\n", style("no phases ran").dim()));
    }

    if !report.artifacts.is_empty() {
        output.push_str(&format!(
            "Artifacts: {} file{} ({})\n",
            report.artifacts.len(),
            if report.artifacts.len() == 1 { "" } else { "s" },
            report.artifact_size()
        ));
    }
    for error in &report.artifact_errors {
        output.push_str(&format!("{} {}\n", style("[!]").yellow(), error));
    }

    if let Some(error) = &report.teardown_error {
        output.push_str(&format!("{} {}\n", style("[!]").yellow(), error));
    }

    if report.cancelled {
        output.push_str(&format!(
            "{}\n",
            style("Build was interrupted; post_build and artifact collection were skipped")
                .yellow()
        ));
    }

    output
}

fn render_phase(result: &PhaseResult, cancelled: bool) -> String {
    let icon = if result.succeeded {
        style("[OK]").green().to_string()
    } else if cancelled {
        style("[--]").yellow().to_string()
    } else {
        style("[X]").red().to_string()
    };

    let exit = match result.exit_code {
        Some(code) => format!("exit {}", code),
        None => "no exit code".to_string(),
    };

    let mut line = format!("{} {} ({})", icon, result.phase, exit);

    if let Some(failure) = &result.failure {
        let what = failure.error.as_deref().unwrap_or("failed");
        let section = if failure.in_finally { " in finally" } else { "" };
        line.push_str(&format!(
            ": `{}`{} {}",
            failure.command,
            section,
            style(what).italic()
        ));
    }

    if result.finalization {
        line.push_str(&format!(" {}", style("[finalization]").dim()));
    }

    line
}
