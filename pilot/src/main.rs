//! `pilot`: plan, build and debug an app with an LLM.
//!
//! Without flags the interactive development flow runs. State (apps, step
//! records, command runs) lives under the configured state directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};

use pilot::error::{is_interrupted, is_token_limit};
use pilot::exit_codes;
use pilot::flow::{Services, UxTest, list_apps_table, run_development, run_ux_test};
use pilot::io::config::{PilotConfig, default_config_path, load_config};
use pilot::io::human::TerminalInput;
use pilot::io::interrupt::Interrupt;
use pilot::io::llm::OpenAiClient;
use pilot::io::process::ProcessRunner;
use pilot::io::prompt::PromptEngine;
use pilot::io::store::JsonStore;
use pilot::logging;

#[derive(Parser)]
#[command(
    name = "pilot",
    version,
    about = "Plan, build and debug an app with an LLM"
)]
struct Cli {
    /// API key for the chat completions endpoint (overrides OPENAI_API_KEY).
    #[arg(long)]
    api_key: Option<String>,
    /// Base URL of the chat completions API (overrides OPENAI_ENDPOINT).
    #[arg(long)]
    api_endpoint: Option<String>,
    /// Config file (default: <config dir>/pilot/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory new app projects are created in (default: <state dir>/workspace).
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Resume an existing app.
    #[arg(long)]
    app_id: Option<String>,
    /// Print created apps with their step counts and exit.
    #[arg(long)]
    get_created_apps_with_steps: bool,
    /// Run a scripted UX scenario instead of the main flow.
    #[arg(long, value_enum)]
    ux_test: Option<UxTest>,
    /// Debug-level tracing for pilot (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

/// How a run ended, before mapping to an exit code.
enum Finish {
    Listed,
    Developed { success: bool },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let interrupt = Interrupt::new();
    let outcome = load_config_for(&cli).and_then(|config| {
        let processes = ProcessRunner::new(config.terminate_grace());
        let outcome = run(&cli, &config, &processes, &interrupt);
        processes.terminate_all();
        outcome
    });
    std::process::exit(exit_code(outcome, &interrupt));
}

fn exit_code(outcome: Result<Finish>, interrupt: &Interrupt) -> i32 {
    match outcome {
        Ok(Finish::Listed) => exit_codes::OK,
        Ok(Finish::Developed { success: true }) => {
            println!("\nThank you for using pilot! Your app is ready.");
            exit_codes::OK
        }
        Ok(Finish::Developed { success: false }) => {
            println!("\nThe app could not be finished. Resume it later with --app-id.");
            exit_codes::ERROR
        }
        Err(err) if is_interrupted(&err) || interrupt.is_set() => {
            eprintln!("\nInterrupted. Progress is saved; resume with --app-id.");
            exit_codes::INTERRUPTED
        }
        Err(err) if is_token_limit(&err) => {
            error!(err = %err, "token limit");
            eprintln!(
                "\n{err:#}\n\nThe conversation no longer fits the model context. This usually \
                 happens when large generated or framework files (lock files, build output, \
                 vendored libraries) end up in the prompt. Remove them from the project or \
                 raise llm.max_tokens for a model with a larger context, then resume."
            );
            exit_codes::TOKEN_LIMIT
        }
        Err(err) => {
            eprintln!("---------- PILOT EXITING WITH ERROR ----------");
            eprintln!("{err:?}");
            eprintln!("----------------------------------------------");
            exit_codes::ERROR
        }
    }
}

/// Config file, then environment, then command-line flags.
fn load_config_for(cli: &Cli) -> Result<PilotConfig> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path)?,
        None => PilotConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(key) = &cli.api_key {
        config.llm.api_key = Some(key.clone());
    }
    if let Some(endpoint) = &cli.api_endpoint {
        config.llm.endpoint = endpoint.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(
    cli: &Cli,
    config: &PilotConfig,
    processes: &ProcessRunner,
    interrupt: &Interrupt,
) -> Result<Finish> {
    let state_dir = config.resolved_state_dir()?;
    let store = JsonStore::new(&state_dir);
    debug!(state_dir = %state_dir.display(), "resolved state directory");

    if cli.get_created_apps_with_steps {
        println!("{}", list_apps_table(&store)?);
        return Ok(Finish::Listed);
    }

    interrupt.install(processes)?;
    let llm = OpenAiClient::new(&config.llm)?;
    let prompts = PromptEngine::new()?;
    let human = TerminalInput;
    let workspace = cli
        .workspace
        .clone()
        .unwrap_or_else(|| state_dir.join("workspace"));
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create {}", workspace.display()))?;

    let services = Services {
        config,
        llm: &llm,
        prompts: &prompts,
        human: &human,
        store: &store,
        processes,
        interrupt,
        workspace: &workspace,
    };
    let success = match cli.ux_test {
        Some(test) => run_ux_test(&services, test)?,
        None => run_development(&services, cli.app_id.as_deref())?,
    };
    Ok(Finish::Developed { success })
}
