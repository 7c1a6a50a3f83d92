use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::{Captures, Regex};

use super::DriverConfig;
use crate::error::{DbkitError, Result};

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env pattern is valid")
    })
}

/// Expand every `${VAR}` reference in `input`.
///
/// All missing variables are reported together.
pub fn expand(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let expanded = env_pattern().replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(DbkitError::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(expanded.into_owned())
}

pub(super) fn expand_in_place(value: &mut String) -> Result<()> {
    *value = expand(value)?;
    Ok(())
}

pub(super) fn expand_driver_map(drivers: &mut HashMap<String, DriverConfig>) -> Result<()> {
    for (name, driver) in drivers.iter_mut() {
        expand_in_place(&mut driver.driver)
            .map_err(|e| e.context(format!("Failed to expand driver for '{}'", name)))?;
        for (key, value) in driver.config.iter_mut() {
            expand_in_place(value).map_err(|e| {
                e.context(format!("Failed to expand '{}' for '{}'", key, name))
            })?;
        }
    }
    Ok(())
}
