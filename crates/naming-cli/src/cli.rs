//! Operator commands
//!
//! Every command loads one delegation config and returns the text to print.
//! Nothing here creates child sessions.

use std::path::Path;

use anyhow::Context;
use naming_core::{
    decompose, template_context, DelegationConfig, EngineSettings, RunRequest, SessionId,
    SimpleRenderer, SubTaskUnit, TemplateRenderer,
};
use nu_ansi_term::Color;
use serde_json::{json, Map, Value as JsonValue};

/// Parent session id used for dry renders
const OPERATOR_SESSION: &str = "naming-cli";

pub fn paint_error(message: &str) -> String {
    Color::Red.bold().paint(format!("error: {}", message)).to_string()
}

fn heading(text: &str) -> String {
    Color::Cyan.bold().paint(text).to_string()
}

fn load(path: &Path) -> anyhow::Result<DelegationConfig> {
    DelegationConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Load and fully check a config, templates included
fn load_checked(path: &Path) -> anyhow::Result<DelegationConfig> {
    let config = load(path)?;
    config.validate_with(&SimpleRenderer::new())?;
    Ok(config)
}

/// Arguments for one call, as given with `--args`
fn call_arguments(raw: Option<&str>) -> anyhow::Result<Map<String, JsonValue>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--args is not valid JSON")? {
        JsonValue::Object(map) => Ok(map),
        other => anyhow::bail!("--args must be a JSON object, got {}", other),
    }
}

fn operator_request(config: &DelegationConfig, arguments: Map<String, JsonValue>) -> RunRequest {
    let person = config.executive_person.clone().unwrap_or_else(|| "operator".to_string());
    RunRequest::new(SessionId::new(OPERATOR_SESSION), person, arguments)
}

pub fn validate(path: &Path) -> anyhow::Result<String> {
    let config = load_checked(path)?;

    let mut lines = vec![format!(
        "{} {} is valid",
        Color::Green.bold().paint("ok:"),
        config.function_name
    )];
    lines.push(format!("  return tool:        {}", config.return_tool.name));
    if let Some(error_tool) = &config.error_tool {
        lines.push(format!(
            "  error tool:         {} (on report: {:?})",
            error_tool.name, error_tool.behavior
        ));
    }
    lines.push(format!("  dangling behavior:  {}", config.dangling_behavior));
    lines.push(format!("  max recursion:      {}", config.max_recursion_level));
    match &config.parallel {
        Some(policy) => lines.push(format!(
            "  parallel:           {:?}, {:?}",
            policy.mode, policy.strategy
        )),
        None => lines.push("  parallel:           no".to_string()),
    }
    Ok(lines.join("\n"))
}

pub fn schema(path: &Path) -> anyhow::Result<String> {
    let config = load_checked(path)?;

    let function = config.tool_spec();
    let return_tool = config.return_tool_spec();
    let error_tool = config.error_tool_spec().map(|spec| {
        json!({
            "name": spec.name,
            "description": spec.description,
            "input_schema": spec.input_schema(),
        })
    });

    let document = json!({
        "function": {
            "name": function.name,
            "description": function.description,
            "input_schema": function.input_schema(),
        },
        "return_tool": {
            "name": return_tool.name,
            "description": return_tool.description,
            "input_schema": return_tool.input_schema(),
        },
        "error_tool": error_tool,
    });
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Render the prompt (or first urging message) each unit of a call would get
pub fn render(path: &Path, args: Option<&str>, urging: bool) -> anyhow::Result<String> {
    let config = load_checked(path)?;
    let arguments = call_arguments(args)?;
    let request = operator_request(&config, arguments);

    let template = if urging {
        &config.urging_template
    } else {
        &config.prompt_template
    };
    let renderer = SimpleRenderer::new();
    let render_one = |request: &RunRequest| -> anyhow::Result<String> {
        let mut context = template_context(&config, request);
        if urging {
            context.insert("depth".into(), json!(request.depth + 1));
            context.insert("urge_count".into(), json!(1));
        }
        Ok(renderer.render(template, &JsonValue::Object(context))?)
    };

    let Some(policy) = &config.parallel else {
        return render_one(&request);
    };

    let units = decompose(policy, &request.arguments)?;
    let mut sections = Vec::with_capacity(units.len());
    for unit in units {
        let title = heading(&format!("--- {} ---", describe(&unit)));
        let text = render_one(&request.clone().with_unit(unit))?;
        sections.push(format!("{}\n{}", title, text));
    }
    if sections.is_empty() {
        return Ok("No units for these arguments".to_string());
    }
    Ok(sections.join("\n\n"))
}

/// Show how one call is split into units and how they would be scheduled
pub fn units(path: &Path, args: Option<&str>, settings: &EngineSettings) -> anyhow::Result<String> {
    let config = load_checked(path)?;
    let Some(policy) = &config.parallel else {
        return Ok(format!(
            "{} has no parallel policy; every call runs one child session",
            config.function_name
        ));
    };

    let arguments = call_arguments(args)?;
    let units = decompose(policy, &arguments)?;

    let timeout = match settings.unit_timeout(policy.timeout_ms) {
        Some(timeout) => format!("{}ms", timeout.as_millis()),
        None => "none".to_string(),
    };
    let mut lines = vec![
        heading(&format!("{} unit(s)", units.len())),
        format!("  mode:             {:?}", policy.mode),
        format!("  strategy:         {:?}", policy.strategy),
        format!(
            "  max concurrency:  {}",
            settings.effective_concurrency(policy.max_concurrency)
        ),
        format!("  unit timeout:     {}", timeout),
    ];
    for unit in &units {
        lines.push(format!("  {}", describe(unit)));
    }
    Ok(lines.join("\n"))
}

fn describe(unit: &SubTaskUnit) -> String {
    format!("[{}] {} = {}", unit.index, unit.name, unit.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REVIEW: &str = r#"
function_name = "review_files"
prompt_template = "Review {{current_parameter.value}} for {{focus}}"
urging_template = "Attempt {{urge_count}}: call {{config.return_tool}}."

[[parameters]]
name = "files"
type = "array"
required = true
items = { name = "file", type = "string" }

[[parameters]]
name = "focus"
type = "string"

[parallel]
mode = "per_list_item"
list_parameter = "files"
max_concurrency = 3
timeout_ms = 1500
"#;

    fn write_config(content: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_validate_reports_every_issue() {
        let file = write_config(
            r#"{"function_name": "", "prompt_template": "Hi {{#if x}}", "urging_template": "Go"}"#,
            ".json",
        );
        let err = validate(file.path()).unwrap_err().to_string();
        assert!(err.contains("function_name: must not be blank"));
        assert!(err.contains("prompt_template"));
    }

    #[test]
    fn test_validate_summary() {
        let file = write_config(REVIEW, ".toml");
        let text = validate(file.path()).unwrap();
        assert!(text.contains("review_files is valid"));
        assert!(text.contains("return_result"));
        assert!(text.contains("PerListItem"));
    }

    #[test]
    fn test_schema_lists_tools() {
        let file = write_config(REVIEW, ".toml");
        let document: JsonValue = serde_json::from_str(&schema(file.path()).unwrap()).unwrap();
        assert_eq!(document["function"]["name"], "review_files");
        assert_eq!(document["function"]["input_schema"]["required"], json!(["files"]));
        assert_eq!(document["return_tool"]["name"], "return_result");
        assert!(document["error_tool"].is_null());
    }

    #[test]
    fn test_render_per_unit() {
        let file = write_config(REVIEW, ".toml");
        let text = render(
            file.path(),
            Some(r#"{"files": ["a.rs", "b.rs"], "focus": "panics"}"#),
            false,
        )
        .unwrap();
        assert!(text.contains("Review a.rs for panics"));
        assert!(text.contains("Review b.rs for panics"));

        let text = render(file.path(), Some(r#"{"files": ["a.rs"]}"#), true).unwrap();
        assert!(text.contains("Attempt 1: call return_result."));
    }

    #[test]
    fn test_render_rejects_bad_arguments() {
        let file = write_config(REVIEW, ".toml");
        let err = render(file.path(), Some("[1, 2]"), false).unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));

        let err = render(file.path(), Some(r#"{"files": 7}"#), false).unwrap_err();
        assert!(err.to_string().contains("files is not enumerable"));
    }

    #[test]
    fn test_units_schedule() {
        let file = write_config(REVIEW, ".toml");
        let settings = EngineSettings::default();
        let text = units(file.path(), Some(r#"{"files": ["a.rs", "b.rs"]}"#), &settings).unwrap();
        assert!(text.contains("2 unit(s)"));
        assert!(text.contains("max concurrency:  3"));
        assert!(text.contains("unit timeout:     1500ms"));
        assert!(text.contains(r#"[1] files = "b.rs""#));
    }

    #[test]
    fn test_units_without_policy() {
        let file = write_config(
            "function_name = \"solo\"\nprompt_template = \"Do it\"\nurging_template = \"Return\"\n",
            ".toml",
        );
        let text = units(file.path(), None, &EngineSettings::default()).unwrap();
        assert!(text.contains("solo has no parallel policy"));
    }
}
