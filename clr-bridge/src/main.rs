//! clr-bridge: check and exercise module configurations from the shell
//!
//! ```text
//! clr-bridge check module.json
//! clr-bridge invoke module.json authorize -a User-Name=alice -a User-Password=secret
//! ```

mod tracing_support;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use clr_bridge_api::{Attribute, Hook, Outcome, RequestContext};
use clr_bridge_host::{ModuleConfig, ModuleInstance, RadiusModule};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_support::{TracingConfig, TracingFormat};

#[derive(Parser, Debug)]
#[command(name = "clr-bridge", version, about = "Host managed RADIUS hooks in-process")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = TracingFormat::Compact, global = true)]
    log_format: TracingFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a module config without loading the runtime
    Check {
        /// JSON module configuration
        config: PathBuf,
    },

    /// Instantiate the module, dispatch one request and detach
    Invoke(InvokeArgs),
}

#[derive(Args, Debug)]
struct InvokeArgs {
    /// JSON module configuration
    config: PathBuf,

    /// Hook to dispatch (authorize, authenticate, post_auth, ...)
    #[arg(value_parser = parse_hook)]
    hook: Hook,

    /// Request attribute as Name=Value
    #[arg(short = 'a', long = "attr", value_parser = parse_attribute)]
    request: Vec<Attribute>,

    /// Control attribute as Name=Value
    #[arg(short = 'c', long = "control", value_parser = parse_attribute)]
    control: Vec<Attribute>,

    /// Request number passed to the hook
    #[arg(long, default_value_t = 0)]
    number: u64,

    /// Print the outcome and resulting lists as JSON
    #[arg(long)]
    json: bool,
}

fn parse_hook(s: &str) -> Result<Hook, String> {
    s.parse::<Hook>().map_err(|e| e.to_string())
}

fn parse_attribute(s: &str) -> Result<Attribute, String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected Name=Value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("attribute name is empty in '{s}'"));
    }
    Ok(Attribute::new(name, value))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let tracing_config = TracingConfig {
        format: cli.log_format,
        ..TracingConfig::default()
    }
    .verbosity(cli.verbose);
    tracing_support::init_subscriber(&tracing_config).context("failed to install logger")?;

    match cli.command {
        Command::Check { config } => {
            let config = load_config(&config)?;
            print!("{}", check_report(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Invoke(args) => invoke(args),
    }
}

fn load_config(path: &Path) -> Result<ModuleConfig> {
    ModuleConfig::from_file(path)
        .with_context(|| format!("invalid module config {}", path.display()))
}

/// Human-readable summary of what instantiation would do
fn check_report(config: &ModuleConfig) -> Result<String> {
    let properties = config
        .startup_properties()
        .context("failed to compute startup properties")?;

    let mut out = String::new();
    writeln!(out, "library:      {}", config.clr_library.display())?;
    writeln!(out, "app name:     {}", config.app_name)?;
    writeln!(out, "base path:    {}", config.app_base_path.display())?;
    writeln!(out, "reply buffer: {} bytes", config.reply_buffer_size)?;

    writeln!(out, "\nhooks:")?;
    let mut enabled = 0;
    for (hook, descriptor) in &config.hooks {
        if descriptor.is_configured() {
            enabled += 1;
        }
        writeln!(out, "  {:<13} {}", hook.name(), descriptor)?;
    }
    writeln!(out, "  ({enabled} of {} enabled)", config.hooks.len())?;

    writeln!(out, "\nstartup properties:")?;
    for (key, value) in properties.iter() {
        writeln!(out, "  {key} = {value}")?;
    }
    Ok(out)
}

fn invoke(args: InvokeArgs) -> Result<ExitCode> {
    if args.hook.is_lifecycle() {
        bail!("'{}' runs at instantiate/detach and cannot be invoked per request", args.hook);
    }

    let config = load_config(&args.config)?;
    let mut module = ModuleInstance::instantiate(&config).context("failed to instantiate module")?;

    let mut ctx = RequestContext::new(args.number);
    ctx.request = args.request;
    ctx.control = args.control;

    let outcome = module.call(args.hook, &mut ctx);
    tracing::info!(hook = %args.hook, outcome = %outcome, "Request dispatched");

    if args.json {
        let doc = serde_json::json!({
            "hook": args.hook,
            "outcome": outcome,
            "code": outcome.code(),
            "request": ctx.request,
            "reply": ctx.reply,
            "control": ctx.control,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print!("{}", outcome_report(outcome, &ctx));
    }

    if let Some(exit_code) = module.detach() {
        tracing::debug!(exit_code, "Runtime shut down");
    }

    Ok(if outcome.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn outcome_report(outcome: Outcome, ctx: &RequestContext) -> String {
    let mut out = format!("outcome: {} ({})\n", outcome, outcome.code());
    for (label, list) in [("reply", &ctx.reply), ("control", &ctx.control)] {
        if list.is_empty() {
            continue;
        }
        out.push_str(label);
        out.push_str(":\n");
        for attribute in list {
            out.push_str("  ");
            out.push_str(&attribute.to_string());
            out.push('\n');
        }
    }
    out
}
