use crate::warn;
use std::str::FromStr;

pub const MAX_CALL_DEPTH_ENV: &str = "SCRIPTVM_MAX_CALL_DEPTH";
pub const FLOAT_EPSILON_ENV: &str = "SCRIPTVM_FLOAT_EPSILON";
pub const REPORT_ABORTS_ENV: &str = "SCRIPTVM_REPORT_ABORTS";

/// Interpreter limits and policies.
#[derive(Debug, Clone, PartialEq)]
pub struct VmConfig {
    /// Maximum number of nested script and native frames.
    pub max_call_depth: usize,
    /// Tolerance of approximate float and vector comparisons.
    pub float_epsilon: f64,
    /// Send aborts that reach the top-level caller to [`Host::report`](crate::virtual_machine::host::Host::report).
    pub report_aborts: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 512,
            float_epsilon: 1.0 / 65536.0,
            report_aborts: true,
        }
    }
}

impl VmConfig {
    /// Defaults overridden by the `SCRIPTVM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(depth) = parse(&lookup, MAX_CALL_DEPTH_ENV, |v: &usize| *v > 0) {
            config.max_call_depth = depth;
        }
        if let Some(eps) = parse(&lookup, FLOAT_EPSILON_ENV, |v: &f64| v.is_finite() && *v >= 0.0) {
            config.float_epsilon = eps;
        }
        if let Some(report) = parse_bool(&lookup, REPORT_ABORTS_ENV) {
            config.report_aborts = report;
        }
        config
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        _ => {
            warn!("ignoring {key}={raw:?}: invalid value");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {key}={raw:?}: expected a boolean");
            None
        }
    }
}
