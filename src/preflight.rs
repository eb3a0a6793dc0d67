//! Preflight checks.
//!
//! Verifies the host has every tool a real run shells out to, before the
//! work directory is touched.

use anyhow::{bail, Result};

use crate::config::Settings;
use crate::process;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - the run will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if no check failed.
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    /// Count of failed checks.
    pub fn fail_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    /// Log every check.
    pub fn log(&self) {
        for check in &self.checks {
            let details = check.details.as_deref().unwrap_or("");
            match check.status {
                CheckStatus::Pass => tracing::debug!("[PASS] {}: {}", check.name, details),
                CheckStatus::Warn => tracing::warn!("[WARN] {}: {}", check.name, details),
                CheckStatus::Fail => tracing::error!("[FAIL] {}: {}", check.name, details),
            }
        }
    }
}

/// Tools a run needs, with package hints.
fn required_tools(settings: &Settings) -> Vec<(String, &'static str, &'static str)> {
    vec![
        (settings.skopeo.clone(), "skopeo", "Required to fetch and export images"),
        (settings.curl.clone(), "curl", "Required to download the metadata layer"),
        ("tar".to_string(), "tar", "Required to unpack layers and pack the rootfs"),
        ("mount".to_string(), "util-linux", "Required to mount the layer overlay"),
        ("umount".to_string(), "util-linux", "Required to release the layer overlay"),
        ("cp".to_string(), "coreutils", "Required to copy the merged tree"),
        ("mknod".to_string(), "coreutils", "Required to create overlay whiteouts"),
        ("setfattr".to_string(), "attr", "Required to mark opaque directories"),
    ]
}

/// Check host tools are installed.
pub fn check_host_tools(settings: &Settings) -> PreflightReport {
    let mut checks = Vec::new();

    for (tool, package, purpose) in required_tools(settings) {
        checks.push(check_tool_exists(&tool, package, purpose));
    }

    if is_root() {
        checks.push(CheckResult::pass_with("root", "running as root"));
    } else {
        checks.push(CheckResult::warn(
            "root",
            "Not running as root - overlay mounts will most likely fail",
        ));
    }

    PreflightReport { checks }
}

/// Run preflight and bail if any check fails.
pub fn run_preflight_or_fail(settings: &Settings) -> Result<()> {
    let report = check_host_tools(settings);
    report.log();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Install the missing tools and retry.",
            report.fail_count()
        );
    }
    Ok(())
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => CheckResult::fail(
            tool,
            &format!("Not found. Install '{}' package. {}", package, purpose),
        ),
    }
}

fn is_root() -> bool {
    process::Cmd::new("id")
        .arg("-u")
        .run()
        .map(|r| r.stdout_trimmed() == "0")
        .unwrap_or(false)
}
