//! Delegation config validation
//!
//! Runs once when a delegation is constructed, before any child session
//! exists. Every problem found is collected so the author sees the whole list
//! at once.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::{DelegationConfig, ExecutionMode, ParallelPolicy};
use crate::template::TemplateRenderer;
use crate::tool::ParameterSpec;

/// One problem in a delegation config
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Dotted location of the offending field, e.g. `return_tool.parameters[1]`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every problem found in one config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, message));
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.issues.extend(other.issues);
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid delegation config ({} issue", self.issues.len())?;
        if self.issues.len() != 1 {
            f.write_str("s")?;
        }
        f.write_str(")")?;
        for issue in &self.issues {
            write!(f, "\n  - {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Names must be non-blank and unique within one schema level; nested object
/// properties and array items are checked as their own levels.
fn check_parameters(path: &str, parameters: &[ParameterSpec], errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    for (i, param) in parameters.iter().enumerate() {
        let here = format!("{}[{}]", path, i);
        if is_blank(&param.name) {
            errors.push(&here, "parameter name must not be blank");
        } else if !seen.insert(param.name.as_str()) {
            errors.push(&here, format!("duplicate parameter name '{}'", param.name));
        }

        if !param.properties.is_empty() {
            check_parameters(&format!("{}.properties", here), &param.properties, errors);
        }
        if let Some(items) = &param.items {
            check_parameters(&format!("{}.items", here), std::slice::from_ref(items.as_ref()), errors);
        }
    }
}

fn check_parallel(config: &DelegationConfig, policy: &ParallelPolicy, errors: &mut ValidationErrors) {
    match policy.mode {
        ExecutionMode::PerParameter => {}
        ExecutionMode::PerListItem => match policy.list_parameter.as_deref() {
            None => errors.push(
                "parallel.list_parameter",
                "per_list_item mode needs a list parameter",
            ),
            Some(name) if is_blank(name) => errors.push(
                "parallel.list_parameter",
                "list parameter name must not be blank",
            ),
            Some(name) => {
                // undeclared parameters are allowed only for schema-less configs
                if !config.parameters.is_empty()
                    && !config.parameters.iter().any(|p| p.name == name)
                {
                    errors.push(
                        "parallel.list_parameter",
                        format!("list parameter '{}' is not a declared parameter", name),
                    );
                }
            }
        },
        ExecutionMode::PerExternalListItem => {
            if policy.external_list.as_ref().is_none_or(|l| l.is_empty()) {
                errors.push(
                    "parallel.external_list",
                    "ExternalStringList must not be null or empty",
                );
            }
        }
    }

    if policy.timeout_ms == Some(0) {
        errors.push("parallel.timeout_ms", "timeout must be greater than zero");
    }
}

impl DelegationConfig {
    /// Check the whole config, reporting every problem found
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if is_blank(&self.function_name) {
            errors.push("function_name", "must not be blank");
        }
        if is_blank(&self.prompt_template) {
            errors.push("prompt_template", "must not be blank");
        }
        if is_blank(&self.urging_template) {
            errors.push("urging_template", "must not be blank");
        }
        check_parameters("parameters", &self.parameters, &mut errors);

        if is_blank(&self.return_tool.name) {
            errors.push("return_tool.name", "must not be blank");
        }
        check_parameters("return_tool.parameters", &self.return_tool.parameters, &mut errors);

        if let Some(error_tool) = &self.error_tool {
            if is_blank(&error_tool.name) {
                errors.push("error_tool.name", "must not be blank");
            } else if error_tool.name == self.return_tool.name {
                errors.push(
                    "error_tool.name",
                    format!(
                        "must differ from the return tool name '{}'",
                        self.return_tool.name
                    ),
                );
            }
            check_parameters("error_tool.parameters", &error_tool.parameters, &mut errors);
        }

        if let Some(person) = &self.executive_person {
            if is_blank(person) {
                errors.push("executive_person", "must not be blank when set");
            }
        }

        if let Some(policy) = &self.parallel {
            check_parallel(self, policy, &mut errors);
        }

        errors.into_result()
    }

    /// `validate`, plus a syntax check of both templates with `renderer`
    pub fn validate_with(&self, renderer: &dyn TemplateRenderer) -> Result<(), ValidationErrors> {
        let mut errors = match self.validate() {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };
        for (path, template) in [
            ("prompt_template", &self.prompt_template),
            ("urging_template", &self.urging_template),
        ] {
            if let Err(e) = renderer.check(template) {
                errors.push(path, e.to_string());
            }
        }
        errors.into_result()
    }
}
