//! Goal/task execution engine CLI.
//!
//! `engine run` decomposes a goal with the configured model and executes the
//! resulting commands on this machine. The remaining subcommands expose the
//! deterministic pieces (safety check, normalization, settings, host context)
//! without talking to a model.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine::core::normalizer::normalize;
use engine::core::types::GoalOutcome;
use engine::core::validator::check_command;
use engine::engine::{EngineConfig, GoalEngine};
use engine::exit_codes;
use engine::io::audit::ExecutionLog;
use engine::io::config::{
    Dispatch, Settings, default_settings_path, load_settings, write_settings,
};
use engine::io::model::OllamaClient;
use engine::io::shell::SystemShell;
use engine::io::system_info::{HostSystemInfo, SystemInfoProvider};
use engine::io::vision::{OllamaVision, VisionClient, encode_images};
use engine::logging;
use tracing::{debug, info};

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Turn a natural-language goal into validated OS commands and run them"
)]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decompose a goal into tasks and execute them.
    Run {
        /// The goal, e.g. `open Spotify and play my liked songs`.
        #[arg(required = true, num_args = 1..)]
        goal: Vec<String>,
        /// Override the generation model.
        #[arg(long)]
        model: Option<String>,
        /// Allow tasks to use the vision model.
        #[arg(long)]
        vision: bool,
        /// Image handed to the vision model. Repeatable.
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        #[arg(long, value_enum)]
        dispatch: Option<DispatchArg>,
        /// Generation attempts per task.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Append attempt records to this JSONL file.
        #[arg(long)]
        execution_log: Option<PathBuf>,
    },
    /// Check one command against the safety policy.
    Check {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the normalized form of one command.
    Normalize {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the effective settings as TOML.
    Settings {
        /// Write the effective settings to the settings file.
        #[arg(long)]
        init: bool,
    },
    /// Print the host context summary sent to the model.
    Context,
}

#[derive(Clone, Copy, ValueEnum)]
enum DispatchArg {
    Sequential,
    Parallel,
}

impl From<DispatchArg> for Dispatch {
    fn from(value: DispatchArg) -> Self {
        match value {
            DispatchArg::Sequential => Dispatch::Sequential,
            DispatchArg::Parallel => Dispatch::Parallel,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli) -> Result<i32> {
    let settings_path = cli.config.unwrap_or_else(default_settings_path);
    match cli.command {
        Command::Run {
            goal,
            model,
            vision,
            images,
            dispatch,
            max_retries,
            execution_log,
        } => {
            let mut settings = load_settings(&settings_path)?;
            settings.apply_env_overrides();
            if let Some(model) = model {
                settings.default_model = model;
            }
            if let Some(dispatch) = dispatch {
                settings.dispatch = dispatch.into();
            }
            if let Some(max_retries) = max_retries {
                settings.max_retries = max_retries;
            }
            if execution_log.is_some() {
                settings.execution_log = execution_log;
            }
            settings.vision_enabled |= vision;
            settings.validate().context("validate settings")?;
            logging::init(&settings.log_level);
            cmd_run(&settings, &goal.join(" "), &images)
        }
        Command::Check { command } => Ok(cmd_check(&command.join(" "))),
        Command::Normalize { command } => {
            println!("{}", normalize(&command.join(" ")));
            Ok(exit_codes::OK)
        }
        Command::Settings { init } => {
            let mut settings = load_settings(&settings_path)?;
            settings.apply_env_overrides();
            if init {
                write_settings(&settings_path, &settings)?;
                eprintln!("wrote {}", settings_path.display());
            }
            print!(
                "{}",
                toml::to_string_pretty(&settings).context("serialize settings")?
            );
            Ok(exit_codes::OK)
        }
        Command::Context => {
            let settings = load_settings(&settings_path)?;
            let summary = HostSystemInfo::new(settings.platform)
                .snapshot()
                .map(|info| info.summary())
                .unwrap_or_default();
            println!("{summary}");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(settings: &Settings, goal: &str, image_paths: &[PathBuf]) -> Result<i32> {
    let model_timeout = Duration::from_secs(settings.model_timeout_secs);
    let model = OllamaClient::new(&settings.endpoint, model_timeout)?;
    let shell = SystemShell::new(settings.platform, settings.output_limit_bytes);
    let log = match &settings.execution_log {
        Some(path) => ExecutionLog::open(path)?,
        None => ExecutionLog::disabled(),
    };
    let vision = if settings.vision_enabled {
        Some(OllamaVision::new(
            &settings.endpoint,
            &settings.vision_model,
            model_timeout,
        )?)
    } else {
        None
    };
    let images = encode_images(image_paths)?;

    let context = HostSystemInfo::new(settings.platform)
        .snapshot()
        .map(|info| info.summary())
        .unwrap_or_default();
    debug!(bytes = context.len(), "host context captured");

    let engine = GoalEngine::new(
        &model,
        &shell,
        &log,
        EngineConfig::from_settings(settings),
        context,
    )?
    .with_vision(vision.as_ref().map(|vision| vision as &dyn VisionClient));

    info!(model = %settings.default_model, endpoint = %model.endpoint(), "running goal");
    let (goal, report) = engine.run_description(goal, settings.vision_enabled, images)?;
    for line in &goal.log {
        println!("{line}");
    }
    for task in &report.completed {
        println!("completed: {task}");
    }
    for task in &report.failed {
        println!("failed: {task}");
    }

    Ok(match report.outcome() {
        GoalOutcome::NothingToDo | GoalOutcome::Success => exit_codes::OK,
        GoalOutcome::PartialFailure => exit_codes::FAILED,
    })
}

fn cmd_check(command: &str) -> i32 {
    match check_command(command) {
        Ok(()) => {
            println!("allowed");
            exit_codes::OK
        }
        Err(rejection) => {
            println!("{rejection}");
            exit_codes::REJECTED
        }
    }
}
