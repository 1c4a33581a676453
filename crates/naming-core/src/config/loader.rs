//! Loading delegation documents
//!
//! Delegation configs are TOML or JSON documents. `${VAR_NAME}` references
//! anywhere in the document are expanded from the environment before parsing;
//! an unset variable expands to an empty string.

use std::path::Path;

use tracing::debug;

use super::DelegationConfig;
use crate::{Error, Result};

/// Expand `${VAR_NAME}` references in `value` from the environment
pub(crate) fn expand_env_vars(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();

            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }

            if !closed {
                // not a reference, keep the text as written
                result.push_str("${");
                result.push_str(&var_name);
            } else if let Ok(env_value) = std::env::var(&var_name) {
                result.push_str(&env_value);
            }
        } else {
            result.push(c);
        }
    }

    result
}

impl DelegationConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(toml::from_str(&expanded)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(serde_json::from_str(&expanded)?)
    }

    /// Load a document from disk; `.json` files are parsed as JSON, anything
    /// else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read delegation config {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(path = %path.display(), "Loading delegation config");

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Load a document and reject it unless it validates
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
