//! Judging a build from the log of its full test run.

use regex::Regex;
use shipyard_core::BuildResult;
use std::sync::LazyLock;

static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:\d{4}-\d\d-\d\d \d\d:\d\d:\d\d,\d{3} \d+ (?:ERROR|CRITICAL) )|(?:Traceback \(most recent call last\):)$",
    )
    .expect("valid error regex")
});

static WARNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d{4}-\d\d-\d\d \d\d:\d\d:\d\d,\d{3} \d+ WARNING ")
        .expect("valid warning regex")
});

const MODULES_LOADED: &str = ".modules.loading: Modules loaded.";
const CLEAN_SHUTDOWN: &str = "Initiating shutdown.";

/// Result of a full test run.
///
/// `post_install_tests` tells whether the server runs tests after install,
/// in which case a clean shutdown must be logged before the build is `ok`.
/// `None` means the log does not allow a verdict.
pub fn evaluate(log: &str, post_install_tests: bool) -> Option<BuildResult> {
    if !log.contains(MODULES_LOADED) {
        return Some(BuildResult::Ko);
    }
    if ERROR_RE.is_match(log) {
        return Some(BuildResult::Ko);
    }
    if WARNING_RE.is_match(log) {
        return Some(BuildResult::Warn);
    }
    if !post_install_tests || log.contains(CLEAN_SHUTDOWN) {
        return Some(BuildResult::Ok);
    }
    None
}
