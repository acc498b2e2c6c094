use crate::archive::{load_volume, save_volume};
use crate::engine::{Action, Engine, LabelEngine};
use crate::render_lineage::render_lineage_svg;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Help,
    Capabilities,
    Summary,
    Load { path: String },
    Save { path: String },
    Action { payload: String },
    Batch { payload: String },
    Undo,
    Redo,
    Tracks,
    SetParam { name: String, value: String },
    RenderLineageSvg { output: String },
    Check,
}

#[derive(Debug, Clone)]
pub struct ShellRunResult {
    pub state_changed: bool,
    pub output: Value,
}

impl ShellCommand {
    pub fn preview(&self) -> String {
        match self {
            Self::Help => "show shell command help".to_string(),
            Self::Capabilities => "inspect engine capabilities".to_string(),
            Self::Summary => "show volume and history summary".to_string(),
            Self::Load { path } => format!("load bundle from '{path}'"),
            Self::Save { path } => format!("save current volume to '{path}'"),
            Self::Action { .. } => "apply one action from JSON".to_string(),
            Self::Batch { .. } => "apply a list of actions from JSON".to_string(),
            Self::Undo => "undo the last action".to_string(),
            Self::Redo => "redo the next action".to_string(),
            Self::Tracks => "show the identity table".to_string(),
            Self::SetParam { name, value } => format!("set parameter '{name}' to {value}"),
            Self::RenderLineageSvg { output } => format!("render lineage SVG to '{output}'"),
            Self::Check => "verify identity index and lineage invariants".to_string(),
        }
    }

    pub fn is_state_mutating(&self) -> bool {
        matches!(
            self,
            Self::Load { .. } | Self::Action { .. } | Self::Batch { .. } | Self::Undo | Self::Redo
        )
    }
}

pub fn shell_help_text() -> &'static str {
    "cellmask shell commands:\n\
help\n\
capabilities\n\
summary\n\
load PATH\n\
save PATH\n\
action <action-json-or-@file>\n\
batch <action-list-json-or-@file>\n\
undo\n\
redo\n\
tracks\n\
set-param NAME <json-value>\n\
render-lineage-svg OUTPUT.svg\n\
check\n\
Actions are {\"action\": NAME, \"params\": {...}}"
}

fn parse_json_payload(raw: &str) -> Result<Value, String> {
    let text = if let Some(path) = raw.strip_prefix('@') {
        fs::read_to_string(path).map_err(|e| format!("Could not read JSON file '{path}': {e}"))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).map_err(|e| format!("Invalid JSON: {e}"))
}

fn token_error(command: &str) -> String {
    format!("Invalid '{command}' usage. Try: help")
}

fn no_args(tokens: &[String], command: ShellCommand) -> Result<ShellCommand, String> {
    if tokens.len() == 1 {
        Ok(command)
    } else {
        Err(token_error(&tokens[0]))
    }
}

pub fn parse_shell_tokens(tokens: &[String]) -> Result<ShellCommand, String> {
    let Some(first) = tokens.first() else {
        return Err("Missing shell command".to_string());
    };
    let cmd = first.as_str();
    match cmd {
        "help" | "-h" | "--help" => Ok(ShellCommand::Help),
        "capabilities" => no_args(tokens, ShellCommand::Capabilities),
        "summary" | "state-summary" => no_args(tokens, ShellCommand::Summary),
        "undo" => no_args(tokens, ShellCommand::Undo),
        "redo" => no_args(tokens, ShellCommand::Redo),
        "tracks" => no_args(tokens, ShellCommand::Tracks),
        "check" => no_args(tokens, ShellCommand::Check),
        "load" | "save" | "render-lineage-svg" => {
            let [_, path] = tokens else {
                return Err(token_error(cmd));
            };
            let path = path.clone();
            Ok(match cmd {
                "load" => ShellCommand::Load { path },
                "save" => ShellCommand::Save { path },
                _ => ShellCommand::RenderLineageSvg { output: path },
            })
        }
        "set-param" => {
            if tokens.len() < 3 {
                return Err(token_error(cmd));
            }
            Ok(ShellCommand::SetParam {
                name: tokens[1].clone(),
                value: tokens[2..].join(" "),
            })
        }
        "action" | "batch" => {
            let payload = tokens[1..].join(" ");
            if payload.trim().is_empty() {
                return Err(format!("Missing {cmd} JSON"));
            }
            Ok(if cmd == "action" {
                ShellCommand::Action { payload }
            } else {
                ShellCommand::Batch { payload }
            })
        }
        other => Err(format!("Unknown shell command '{other}'. Try: help")),
    }
}

pub fn parse_shell_line(line: &str) -> Result<ShellCommand, String> {
    let tokens = split_shell_words(line)?;
    parse_shell_tokens(&tokens)
}

/// Strip one pair of surrounding single quotes, if present.
fn unquote(text: &str) -> Result<&str, String> {
    match text.strip_prefix('\'') {
        Some(inner) => inner
            .strip_suffix('\'')
            .ok_or_else(|| "Unterminated quoted string in shell command".to_string()),
        None => Ok(text),
    }
}

/// Whitespace-separated words; single quotes group a path with spaces.
fn split_words(text: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in text.chars() {
        match ch {
            '\'' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err("Unterminated quoted string in shell command".to_string());
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out)
}

/// Split one shell line into the command word and its arguments.
///
/// `action` and `batch` take the rest of the line as a single JSON payload,
/// `set-param` takes a name and a JSON value, so JSON never needs escaping.
/// Other commands take plain words.
pub fn split_shell_words(line: &str) -> Result<Vec<String>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("Empty shell command".to_string());
    }
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut words = vec![command.to_string()];
    match command {
        "action" | "batch" => {
            if !rest.is_empty() {
                words.push(unquote(rest)?.to_string());
            }
        }
        "set-param" => {
            let (name, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if !name.is_empty() {
                words.push(name.to_string());
            }
            let value = value.trim();
            if !value.is_empty() {
                words.push(unquote(value)?.to_string());
            }
        }
        _ => words.extend(split_words(rest)?),
    }
    Ok(words)
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Could not serialize {what}: {e}"))
}

pub fn execute_shell_command(
    engine: &mut LabelEngine,
    command: &ShellCommand,
) -> Result<ShellRunResult, String> {
    let result = match command {
        ShellCommand::Help => ShellRunResult {
            state_changed: false,
            output: json!({ "help": shell_help_text() }),
        },
        ShellCommand::Capabilities => ShellRunResult {
            state_changed: false,
            output: to_json(&LabelEngine::capabilities(), "capabilities")?,
        },
        ShellCommand::Summary => ShellRunResult {
            state_changed: false,
            output: to_json(&engine.summarize(), "summary")?,
        },
        ShellCommand::Load { path } => {
            let volume = load_volume(Path::new(path)).map_err(|e| e.to_string())?;
            *engine = LabelEngine::with_parameters(volume, engine.parameters().clone());
            ShellRunResult {
                state_changed: true,
                output: json!({
                    "message": format!("Loaded bundle from '{path}'"),
                    "summary": engine.summarize()
                }),
            }
        }
        ShellCommand::Save { path } => {
            save_volume(engine.volume(), Path::new(path)).map_err(|e| e.to_string())?;
            ShellRunResult {
                state_changed: false,
                output: json!({ "message": format!("Saved volume to '{path}'") }),
            }
        }
        ShellCommand::Action { payload } => {
            let action = Action::from_json(parse_json_payload(payload)?).map_err(|e| e.to_string())?;
            let result = engine.apply(action).map_err(|e| e.to_string())?;
            ShellRunResult {
                state_changed: !result.changes.is_empty(),
                output: json!({ "result": result }),
            }
        }
        ShellCommand::Batch { payload } => {
            let Value::Array(items) = parse_json_payload(payload)? else {
                return Err("Batch JSON must be a list of actions".to_string());
            };
            let actions = items
                .into_iter()
                .map(Action::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            let results = engine.apply_batch(actions).map_err(|e| e.to_string())?;
            ShellRunResult {
                state_changed: results.iter().any(|r| !r.changes.is_empty()),
                output: json!({ "results": results }),
            }
        }
        ShellCommand::Undo | ShellCommand::Redo => {
            let payload = if *command == ShellCommand::Undo {
                engine.undo()
            } else {
                engine.redo()
            }
            .map_err(|e| e.to_string())?;
            match payload {
                Some(payload) => ShellRunResult {
                    state_changed: true,
                    output: json!({ "history": payload }),
                },
                None => ShellRunResult {
                    state_changed: false,
                    output: json!({ "message": "Nothing to do" }),
                },
            }
        }
        ShellCommand::Tracks => ShellRunResult {
            state_changed: false,
            output: to_json(&engine.volume().annotations().readable_table(), "identity table")?,
        },
        ShellCommand::SetParam { name, value } => {
            let value: Value = serde_json::from_str(value)
                .map_err(|e| format!("Invalid value for '{name}': {e}"))?;
            let message = engine.set_parameter(name, &value).map_err(|e| e.to_string())?;
            ShellRunResult {
                state_changed: false,
                output: json!({ "message": message, "parameters": engine.parameters() }),
            }
        }
        ShellCommand::RenderLineageSvg { output } => {
            let graph = engine
                .volume()
                .lineage()
                .ok_or_else(|| "Lineage rendering needs a tracking file".to_string())?;
            fs::write(output, render_lineage_svg(graph))
                .map_err(|e| format!("Could not write SVG to '{output}': {e}"))?;
            ShellRunResult {
                state_changed: false,
                output: json!({ "message": format!("Wrote lineage SVG to '{output}'") }),
            }
        }
        ShellCommand::Check => {
            let problems = engine.check_consistency();
            ShellRunResult {
                state_changed: false,
                output: json!({ "consistent": problems.is_empty(), "problems": problems }),
            }
        }
    };
    Ok(result)
}
