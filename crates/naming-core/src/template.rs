//! Prompt and urging-message templates
//!
//! Delegation prompts are rendered through the [`TemplateRenderer`] trait so
//! hosts can plug in their own engine. [`SimpleRenderer`] is the bundled
//! implementation.
//!
//! # Syntax
//!
//! - `{{name}}` - value of `name`; dotted paths (`{{user.address.city}}`) and
//!   array indices (`{{items.0}}`) are supported
//! - `{{#if path}}...{{else}}...{{/if}}` - conditional on the truthiness of `path`
//! - `{{#each path}}...{{/each}}` - loop over an array; `{{this}}` is the
//!   current element and `{{@index}}` its position
//! - `{{{{` - renders as a literal `{{`
//!
//! Referencing an undefined value outside of `#if` is an error rather than an
//! empty substitution, so typos in templates surface as configuration errors.

use serde_json::Value;
use thiserror::Error;

/// Error type for template parsing and rendering failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("undefined variable '{name}' at position {position} in template")]
    UndefinedVariable { name: String, position: usize },

    #[error("unclosed '{{{{' at position {position} in template")]
    UnclosedTag { position: usize },

    #[error("empty tag at position {position} in template")]
    EmptyTag { position: usize },

    #[error("unknown block '#{name}' at position {position} in template")]
    UnknownBlock { name: String, position: usize },

    #[error("block '#{name}' opened at position {position} is never closed")]
    UnclosedBlock { name: String, position: usize },

    #[error("unexpected '{tag}' at position {position} in template")]
    UnexpectedTag { tag: String, position: usize },

    #[error("'{name}' at position {position} is not an array")]
    NotIterable { name: String, position: usize },
}

/// Renders a template against a JSON context.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<String, TemplateError>;

    /// Syntax check without a context. Engines that cannot check ahead of time
    /// accept everything.
    fn check(&self, _template: &str) -> Result<(), TemplateError> {
        Ok(())
    }
}

/// Bundled handlebars-style renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRenderer;

impl SimpleRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateRenderer for SimpleRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String, TemplateError> {
        let nodes = parse(template)?;
        let mut out = String::with_capacity(template.len());
        let mut scopes = vec![Scope {
            value: context,
            index: None,
        }];
        render_nodes(&nodes, &mut scopes, &mut out)?;
        Ok(out)
    }

    fn check(&self, template: &str) -> Result<(), TemplateError> {
        parse(template).map(|_| ())
    }
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var {
        path: String,
        position: usize,
    },
    If {
        path: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Each {
        path: String,
        position: usize,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    Each,
}

impl BlockKind {
    fn name(self) -> &'static str {
        match self {
            Self::If => "if",
            Self::Each => "each",
        }
    }
}

struct Frame {
    kind: BlockKind,
    path: String,
    position: usize,
    body: Vec<Node>,
    otherwise: Option<Vec<Node>>,
}

impl Frame {
    fn current(&mut self) -> &mut Vec<Node> {
        match self.otherwise {
            Some(ref mut nodes) => nodes,
            None => &mut self.body,
        }
    }

    fn into_node(self) -> Node {
        let otherwise = self.otherwise.unwrap_or_default();
        match self.kind {
            BlockKind::If => Node::If {
                path: self.path,
                then: self.body,
                otherwise,
            },
            BlockKind::Each => Node::Each {
                path: self.path,
                position: self.position,
                body: self.body,
                otherwise,
            },
        }
    }
}

fn push_node(root: &mut Vec<Node>, stack: &mut [Frame], node: Node) {
    match stack.last_mut() {
        Some(frame) => frame.current().push(node),
        None => root.push(node),
    }
}

fn parse(template: &str) -> Result<Vec<Node>, TemplateError> {
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut text = String::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        text.push_str(&rest[..start]);
        let position = offset + start;
        let after = &rest[start + 2..];

        if let Some(escaped) = after.strip_prefix("{{") {
            text.push_str("{{");
            offset = position + 4;
            rest = escaped;
            continue;
        }

        let end = after
            .find("}}")
            .ok_or(TemplateError::UnclosedTag { position })?;
        let tag = after[..end].trim();

        if !text.is_empty() {
            push_node(&mut root, &mut stack, Node::Text(std::mem::take(&mut text)));
        }

        if tag.is_empty() {
            return Err(TemplateError::EmptyTag { position });
        } else if let Some(open) = tag.strip_prefix('#') {
            let (keyword, path) = open.split_once(char::is_whitespace).unwrap_or((open, ""));
            let kind = match keyword {
                "if" => BlockKind::If,
                "each" => BlockKind::Each,
                other => {
                    return Err(TemplateError::UnknownBlock {
                        name: other.to_string(),
                        position,
                    });
                }
            };
            let path = path.trim();
            if path.is_empty() {
                return Err(TemplateError::EmptyTag { position });
            }
            stack.push(Frame {
                kind,
                path: path.to_string(),
                position,
                body: Vec::new(),
                otherwise: None,
            });
        } else if let Some(close) = tag.strip_prefix('/') {
            let matches_top = stack
                .last()
                .is_some_and(|frame| frame.kind.name() == close.trim());
            if !matches_top {
                return Err(TemplateError::UnexpectedTag {
                    tag: tag.to_string(),
                    position,
                });
            }
            if let Some(frame) = stack.pop() {
                push_node(&mut root, &mut stack, frame.into_node());
            }
        } else if tag == "else" {
            match stack.last_mut() {
                Some(frame) if frame.otherwise.is_none() => frame.otherwise = Some(Vec::new()),
                _ => {
                    return Err(TemplateError::UnexpectedTag {
                        tag: tag.to_string(),
                        position,
                    });
                }
            }
        } else {
            push_node(
                &mut root,
                &mut stack,
                Node::Var {
                    path: tag.to_string(),
                    position,
                },
            );
        }

        offset = position + 2 + end + 2;
        rest = &after[end + 2..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        push_node(&mut root, &mut stack, Node::Text(text));
    }

    if let Some(frame) = stack.pop() {
        return Err(TemplateError::UnclosedBlock {
            name: frame.kind.name().to_string(),
            position: frame.position,
        });
    }

    Ok(root)
}

struct Scope<'a> {
    value: &'a Value,
    index: Option<usize>,
}

enum Resolved<'a> {
    Value(&'a Value),
    Index(usize),
}

fn lookup<'a>(path: &str, scopes: &[Scope<'a>]) -> Option<Resolved<'a>> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current: &'a Value = match head {
        "@index" => {
            return scopes.iter().rev().find_map(|s| s.index).map(Resolved::Index);
        }
        "this" => scopes.last()?.value,
        name => scopes.iter().rev().find_map(|s| s.value.get(name))?,
    };
    for segment in segments {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    Some(Resolved::Value(current))
}

fn truthy(resolved: Option<Resolved<'_>>) -> bool {
    match resolved {
        None => false,
        Some(Resolved::Index(_)) => true,
        Some(Resolved::Value(value)) => match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        },
    }
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

fn render_nodes<'a>(
    nodes: &[Node],
    scopes: &mut Vec<Scope<'a>>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, position } => match lookup(path, scopes) {
                Some(Resolved::Value(value)) => write_value(value, out),
                Some(Resolved::Index(index)) => out.push_str(&index.to_string()),
                None => {
                    return Err(TemplateError::UndefinedVariable {
                        name: path.clone(),
                        position: *position,
                    });
                }
            },
            Node::If {
                path,
                then,
                otherwise,
            } => {
                let branch = if truthy(lookup(path, scopes)) {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, scopes, out)?;
            }
            Node::Each {
                path,
                position,
                body,
                otherwise,
            } => {
                let items: &'a [Value] = match lookup(path, scopes) {
                    Some(Resolved::Value(Value::Array(items))) => items,
                    Some(Resolved::Value(Value::Null)) | None => &[],
                    Some(_) => {
                        return Err(TemplateError::NotIterable {
                            name: path.clone(),
                            position: *position,
                        });
                    }
                };
                if items.is_empty() {
                    render_nodes(otherwise, scopes, out)?;
                    continue;
                }
                for (index, item) in items.iter().enumerate() {
                    scopes.push(Scope {
                        value: item,
                        index: Some(index),
                    });
                    let rendered = render_nodes(body, scopes, out);
                    scopes.pop();
                    rendered?;
                }
            }
        }
    }
    Ok(())
}
