use flowgate_core::config::{AppConfig, LoadOptions};
use flowgate_db::{connect_from_config, SeedDataset};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct ReadinessCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct ReadinessReport {
    overall_status: CheckStatus,
    passed: usize,
    failed: usize,
    skipped: usize,
    checks: Vec<ReadinessCheck>,
}

fn pass(name: &'static str, details: impl Into<String>) -> ReadinessCheck {
    ReadinessCheck { name, status: CheckStatus::Pass, details: details.into() }
}

fn fail(name: &'static str, details: impl Into<String>) -> ReadinessCheck {
    ReadinessCheck { name, status: CheckStatus::Fail, details: details.into() }
}

fn skip(name: &'static str, details: impl Into<String>) -> ReadinessCheck {
    ReadinessCheck { name, status: CheckStatus::Skipped, details: details.into() }
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"checks\":[],\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> ReadinessReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(pass("config_validation", "configuration loaded and validated"));
            checks.push(step_catalog_check(&config));
            checks.extend(database_checks(&config));
        }
        Err(error) => {
            checks.push(fail("config_validation", error.to_string()));
            for name in ["step_catalog", "database_connectivity", "seed_dataset"] {
                checks.push(skip(name, "configuration did not load"));
            }
        }
    }

    summarize(checks)
}

fn summarize(checks: Vec<ReadinessCheck>) -> ReadinessReport {
    let passed = checks.iter().filter(|check| check.status == CheckStatus::Pass).count();
    let failed = checks.iter().filter(|check| check.status == CheckStatus::Fail).count();
    let skipped = checks.len() - passed - failed;
    let overall_status = if failed == 0 { CheckStatus::Pass } else { CheckStatus::Fail };
    ReadinessReport { overall_status, passed, failed, skipped, checks }
}

fn step_catalog_check(config: &AppConfig) -> ReadinessCheck {
    let catalog = config.step_catalog();
    let known_types = catalog.known_types();
    pass(
        "step_catalog",
        format!(
            "catalog v{} resolves {} request types ({}), plus a generic fallback",
            catalog.version(),
            known_types.len(),
            known_types.join(", ")
        ),
    )
}

/// Connectivity and the demo dataset share one pool. An unseeded database is
/// a skip, not a failure; `flowgate seed` is optional.
fn database_checks(config: &AppConfig) -> Vec<ReadinessCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                fail(
                    "database_connectivity",
                    format!("failed to initialize async runtime: {error}"),
                ),
                skip("seed_dataset", "no database connection"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    fail(
                        "database_connectivity",
                        format!("failed to connect using `{}`: {error}", config.database.url),
                    ),
                    skip("seed_dataset", "no database connection"),
                ];
            }
        };

        let connectivity =
            pass("database_connectivity", format!("connected using `{}`", config.database.url));
        let seed = match SeedDataset::verify(&pool).await {
            Ok(verification) if verification.passed => {
                pass("seed_dataset", "demo dataset rows are all present")
            }
            Ok(verification) => skip(
                "seed_dataset",
                format!(
                    "demo dataset not loaded (missing: {})",
                    verification.failed_checks.join(", ")
                ),
            ),
            Err(error) => {
                skip("seed_dataset", format!("schema not ready for verification: {error}"))
            }
        };
        pool.close().await;
        vec![connectivity, seed]
    })
}

fn render_human(report: &ReadinessReport) -> String {
    let mut lines = vec![format!(
        "doctor: {} passed, {} failed, {} skipped",
        report.passed, report.failed, report.skipped
    )];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("[{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
