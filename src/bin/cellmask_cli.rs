use anyhow::{anyhow, bail, Context, Result};
use cellmask::archive::{load_volume, save_volume};
use cellmask::engine::{Engine, EngineParameters, LabelEngine};
use cellmask::shell::{
    execute_shell_command, parse_shell_line, parse_shell_tokens, shell_help_text, ShellCommand,
};
use serde::Serialize;
use std::env;
use std::io::{self, BufRead};
use std::path::Path;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn usage() {
    eprintln!(
        "Usage:\n  \
  cellmask_cli --version\n  \
  cellmask_cli capabilities\n  \
  cellmask_cli [--config PATH] BUNDLE <shell command...>\n  \
  cellmask_cli [--config PATH] BUNDLE shell\n\n  \
  BUNDLE is a .npz/.zip (z-stack) or .trk/.trks (tracking) JSON bundle,\n  \
  optionally ending in .gz. Commands that change the volume save it back.\n  \
  Tip: pass @file.json instead of inline JSON\n\n{}",
        shell_help_text()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn parse_global_config_arg(args: &[String]) -> Result<(Option<String>, usize)> {
    if args.get(1).is_some_and(|a| a == "--config") {
        let path = args
            .get(2)
            .ok_or_else(|| anyhow!("Missing path after --config"))?;
        return Ok((Some(path.clone()), 3));
    }
    Ok((None, 1))
}

fn open_engine(bundle: &str, config: Option<&str>) -> Result<LabelEngine> {
    let parameters = match config {
        Some(path) => EngineParameters::load_from_path(path).map_err(|e| anyhow!("{e}"))?,
        None => EngineParameters::default(),
    };
    let volume = load_volume(Path::new(bundle)).map_err(|e| anyhow!("{e}"))?;
    Ok(LabelEngine::with_parameters(volume, parameters))
}

/// Read commands from stdin until EOF. Failed commands are reported and the
/// session keeps going.
fn run_interactive(engine: &mut LabelEngine) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Could not read from stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if matches!(trimmed, "exit" | "quit") {
            break;
        }
        let outcome = parse_shell_line(trimmed)
            .and_then(|command| {
                debug!(command = %command.preview(), "shell command");
                execute_shell_command(engine, &command)
            });
        match outcome {
            Ok(result) => print_json(&result.output)?,
            Err(message) => print_json(&serde_json::json!({ "error": message }))?,
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("cellmask {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (config, bundle_idx) = parse_global_config_arg(&args)?;
    let Some(bundle) = args.get(bundle_idx) else {
        usage();
        bail!("Missing bundle path");
    };
    match bundle.as_str() {
        "capabilities" => return print_json(&LabelEngine::capabilities()),
        "help" | "-h" | "--help" => {
            usage();
            return Ok(());
        }
        _ => {}
    }

    let tokens = &args[bundle_idx + 1..];
    if tokens.is_empty() {
        usage();
        bail!("Missing command for '{bundle}'");
    }

    let mut engine = open_engine(bundle, config.as_deref())
        .with_context(|| format!("Could not open '{bundle}'"))?;

    if tokens.len() == 1 && tokens[0] == "shell" {
        return run_interactive(&mut engine);
    }

    let command: ShellCommand = parse_shell_tokens(tokens).map_err(|e| anyhow!(e))?;
    let result = execute_shell_command(&mut engine, &command).map_err(|e| anyhow!(e))?;
    if command.is_state_mutating() && result.state_changed {
        save_volume(engine.volume(), Path::new(bundle)).map_err(|e| anyhow!("{e}"))?;
        info!(bundle = %bundle, "saved changes");
    }
    print_json(&result.output)
}
