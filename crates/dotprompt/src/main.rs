use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use ariadne::{Color, Label, Report, ReportKind, Source};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dotprompt_common::config::{self, DotpromptConfig};
use dotprompt_parser::{parse, parse_continuation, ParseError};
use dotprompt_runtime::variables::parse_value;
use dotprompt_runtime::{
    Engine, EngineStatus, FileSessionStore, FunctionRegistry, ModelCatalog, Runtime, SessionStore,
};

/// dotprompt: run prompt scripts against LLM providers.
#[derive(Parser)]
#[command(
    name = "dotprompt",
    version,
    about,
    long_about = "dotprompt interpreter.\n\nRuns line-based prompt scripts that drive multi-turn LLM conversations.\n\nExamples:\n  dotprompt run chat.prompt                 Run a script and save the session\n  dotprompt run chat.prompt --set city=Oslo Preset a variable\n  dotprompt check chat.prompt               Parse only\n  dotprompt reply <session-id> \"And then?\"  Continue a saved conversation\n  dotprompt functions                       List discovered functions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to dotprompt.toml (default: search upward)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Execute a script
    Run {
        /// Path to the script
        script: PathBuf,

        /// Preset a variable (name=value; JSON values are parsed)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Do not save the session afterwards
        #[arg(long)]
        no_save: bool,

        /// Suppress .print output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Parse a script and report errors without running it
    Check {
        script: PathBuf,
    },

    /// Continue a saved session with a new user message
    Reply {
        session_id: String,

        /// Message text; '-' or nothing reads stdin
        message: Vec<String>,
    },

    /// List functions discovered in the configured directories
    Functions,

    /// List known models and prices
    Models,

    /// List saved sessions
    Sessions,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(msg) = dispatch(cli) {
        eprintln!("{}", msg);
        process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn dispatch(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Run {
            script,
            vars,
            no_save,
            quiet,
        } => run_script(&script, &vars, no_save, quiet, cli.config.as_deref()),
        Command::Check { script } => {
            let (source, _) = read_script(&script)?;
            let statements = parse_or_report(&source, &script)?;
            println!("{}: {} statements", script.display(), statements.len());
            Ok(())
        }
        Command::Reply {
            session_id,
            message,
        } => reply(&session_id, &message, cli.config.as_deref()),
        Command::Functions => list_functions(cli.config.as_deref()),
        Command::Models => list_models(cli.config.as_deref()),
        Command::Sessions => list_sessions(cli.config.as_deref()),
    }
}

// ============================================================================
// dotprompt run
// ============================================================================

fn run_script(
    script: &Path,
    vars: &[String],
    no_save: bool,
    quiet: bool,
    config_path: Option<&Path>,
) -> Result<(), String> {
    let (source, script_dir) = read_script(script)?;
    let statements = parse_or_report(&source, script)?;
    let config = load_config(config_path, &script_dir)?;

    let runtime = Runtime::from_config(&config, &script_dir).map_err(|e| format!("error: {}", e))?;
    let file_name = script
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let mut engine = Engine::new(statements, runtime).with_filename(file_name);
    if quiet {
        engine.set_output_handler(|_| {});
    }
    for assignment in vars {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| format!("error: --set expects NAME=VALUE, got '{}'", assignment))?;
        engine
            .set_variable(name.trim(), parse_value(value))
            .map_err(|e| format!("error: --set {}: {}", name, e))?;
    }

    let outcome = engine.run();
    if !no_save {
        save_session(&mut engine, &config)?;
    }
    match outcome {
        Ok(_) => Ok(()),
        Err(e) => Err(format!("error: {}", e)),
    }
}

fn save_session(engine: &mut Engine, config: &DotpromptConfig) -> Result<(), String> {
    let store = FileSessionStore::new(config.sessions_dir());
    engine
        .persist(&store)
        .map_err(|e| format!("error: could not save session: {}", e))?;
    eprintln!("session: {} ({})", engine.session_id(), engine.status());
    Ok(())
}

// ============================================================================
// dotprompt reply
// ============================================================================

fn reply(session_id: &str, message: &[String], config_path: Option<&Path>) -> Result<(), String> {
    let text = if message.is_empty() || message == ["-"] {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("error: could not read stdin: {}", e))?;
        buf
    } else {
        message.join(" ")
    };
    if text.trim().is_empty() {
        return Err("error: reply message is empty".to_string());
    }

    let cwd = current_dir()?;
    let config = load_config(config_path, &cwd)?;
    let store = FileSessionStore::new(config.sessions_dir());
    let record = store.load(session_id).map_err(|e| format!("error: {}", e))?;

    let runtime = Runtime::from_config(&config, &config.root_dir).map_err(|e| format!("error: {}", e))?;
    let mut engine = Engine::restore(record, runtime);
    engine
        .continue_with(parse_continuation(&text))
        .map_err(|e| format!("error: {}", e))?;

    let outcome = engine.run();
    save_session(&mut engine, &config)?;
    match outcome {
        Ok(_) => Ok(()),
        Err(e) => Err(format!("error: {}", e)),
    }
}

// ============================================================================
// Listings
// ============================================================================

fn list_functions(config_path: Option<&Path>) -> Result<(), String> {
    let config = load_config(config_path, &current_dir()?)?;
    let mut registry = FunctionRegistry::new(
        config.function_dirs(),
        Duration::from_secs(config.functions.timeout_secs),
    );
    registry.refresh().map_err(|e| format!("error: {}", e))?;

    let mut any = false;
    for descriptor in registry.descriptors() {
        any = true;
        println!(
            "{:<24} {}  [{}]",
            descriptor.name,
            descriptor.description,
            descriptor.executable.display()
        );
    }
    if !any {
        for dir in config.function_dirs() {
            eprintln!("no functions found in {}", dir.display());
        }
    }
    Ok(())
}

fn list_models(config_path: Option<&Path>) -> Result<(), String> {
    let config = load_config(config_path, &current_dir()?)?;
    let catalog = ModelCatalog::builtin().with_overrides(&config.models);
    println!(
        "{:<32} {:<10} {:>12} {:>12}",
        "model", "provider", "in $/1M", "out $/1M"
    );
    for model in catalog.iter() {
        println!(
            "{:<32} {:<10} {:>12.2} {:>12.2}",
            model.name,
            model.provider,
            model.input * 1_000_000.0,
            model.output * 1_000_000.0
        );
    }
    Ok(())
}

fn list_sessions(config_path: Option<&Path>) -> Result<(), String> {
    let config = load_config(config_path, &current_dir()?)?;
    let store = FileSessionStore::new(config.sessions_dir());
    let sessions = store.list().map_err(|e| format!("error: {}", e))?;
    for s in sessions {
        let marker = if s.status == EngineStatus::Failed { "!" } else { " " };
        println!(
            "{}{}  {:<9}  {:>3} msgs  {}  {}",
            marker,
            s.session_id,
            s.status,
            s.messages,
            s.updated_at.format("%Y-%m-%d %H:%M"),
            s.filename.unwrap_or_default()
        );
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn current_dir() -> Result<PathBuf, String> {
    std::env::current_dir().map_err(|e| format!("error: cannot determine current directory: {}", e))
}

/// Read a script and resolve the directory its relative paths are anchored to.
fn read_script(script: &Path) -> Result<(String, PathBuf), String> {
    let source = fs::read_to_string(script)
        .map_err(|e| format!("error: could not read '{}': {}", script.display(), e))?;
    let abs = fs::canonicalize(script).unwrap_or_else(|_| script.to_path_buf());
    let dir = abs
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((source, dir))
}

fn load_config(explicit: Option<&Path>, start_dir: &Path) -> Result<DotpromptConfig, String> {
    let result = match explicit {
        Some(path) => config::load_config(path),
        None => config::discover_config(start_dir),
    };
    let config = result.map_err(|e| format!("error: {}", e))?;
    debug!(root = %config.root_dir.display(), "loaded config");
    Ok(config)
}

fn parse_or_report(
    source: &str,
    script: &Path,
) -> Result<Vec<dotprompt_common::Statement>, String> {
    parse(source).map_err(|e| {
        let file_name = script.display().to_string();
        print_parse_error(&e, source, &file_name);
        format!("error: {} has errors", file_name)
    })
}

fn print_parse_error(error: &ParseError, source: &str, file_name: &str) {
    let start = error.offset.min(source.len());
    let end = (start + error.len).max(start + 1).min(source.len().max(start + 1));
    let rendered = Report::build(ReportKind::Error, file_name, start)
        .with_message(&error.message)
        .with_label(
            Label::new((file_name, start..end))
                .with_message(format!("line {}", error.line))
                .with_color(Color::Red),
        )
        .with_help("text lines continue the .system/.user/.assistant/.text above them")
        .finish()
        .eprint((file_name, Source::from(source)));
    if rendered.is_err() {
        eprintln!("{}", error);
    }
}
