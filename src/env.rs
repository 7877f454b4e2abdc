//! `${VAR}` expansion for the service config file and instance secrets

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;
use crate::error::{Result, SkymountError};

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid reference pattern"));

/// Expand every `${VAR}` in `input`, failing with the names of all unset variables
pub fn substitute_env_vars(input: &str) -> std::result::Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();
    let expanded = REFERENCE.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        env::var(name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }
    Ok(expanded.into_owned())
}

/// Expand an instance secret; a secret with no references is kept verbatim
pub fn resolve_secret(secret: &str) -> Result<String> {
    substitute_env_vars(secret).map_err(|e| SkymountError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expands_config_text() {
        env::set_var("SKYMOUNT_TEST_HOST", "files.example.net");
        let out = substitute_env_vars("host: ${SKYMOUNT_TEST_HOST}:${SKYMOUNT_TEST_HOST}").unwrap();
        assert_eq!(out, "host: files.example.net:files.example.net");
        env::remove_var("SKYMOUNT_TEST_HOST");
    }

    #[test]
    fn test_unset_names_reported_once() {
        let err = substitute_env_vars("${SKYMOUNT_UNSET_A} ${SKYMOUNT_UNSET_B} ${SKYMOUNT_UNSET_A}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SKYMOUNT_UNSET_A, SKYMOUNT_UNSET_B"), "{}", err);
        assert_eq!(err.matches("SKYMOUNT_UNSET_A").count(), 1);
    }

    #[test]
    fn test_secret_literals_survive() {
        assert_eq!(resolve_secret("pa$$word").unwrap(), "pa$$word");
        assert_eq!(resolve_secret("$HOME {x}").unwrap(), "$HOME {x}");

        env::set_var("SKYMOUNT_TEST_SECRET", "s3cr3t");
        assert_eq!(resolve_secret("${SKYMOUNT_TEST_SECRET}").unwrap(), "s3cr3t");
        env::remove_var("SKYMOUNT_TEST_SECRET");

        let err = resolve_secret("${SKYMOUNT_UNSET_SECRET}").unwrap_err();
        assert_eq!(err.code(), "InvalidConfig");
    }
}
