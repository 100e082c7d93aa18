//! shai - turn natural-language requests into shell commands

mod config;
mod terminal;
mod tools;
mod utils;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use shai_agent::{
    ConversationEngine, EngineConfig, FileThreadStore, FunctionRegistry, SessionConfig,
    SessionLoop, ThreadStore, run_single_turn,
};
use shai_llm::providers::create_provider;
use shai_llm::{FunctionCallPolicy, ModelCatalog, ProviderKind};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::terminal::{InitialInput, StdinReader, TerminalDisplay};
use crate::tools::{AutoApprove, CommandApproval, EXECUTE_COMMAND, ExecuteCommand};

const DEFAULT_PROVIDER: &str = "openai";

/// ai - ask for a shell command in plain words
#[derive(Parser, Debug)]
#[command(name = "ai")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What you want done, e.g. `ai list files larger than 1MB`
    input: Vec<String>,

    /// Start a multi-turn conversation saved as a thread
    #[arg(short, long)]
    agent: bool,

    /// Resume a saved thread (with --agent)
    #[arg(short, long, requires = "agent")]
    thread: Option<String>,

    /// List saved threads
    #[arg(long)]
    threads: bool,

    /// Provider (openai, anthropic, groq, openrouter, ollama)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (default: the provider's default)
    #[arg(short, long)]
    model: Option<String>,

    /// Run commands without asking for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Create the config file if missing and show an example
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose || std::env::var_os("RUST_LOG").is_some() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("shai_cli=debug,shai_agent=debug,shai_llm=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if args.init_config {
        let path = Config::init().context("Error creating config")?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    if args.threads {
        return list_threads().await;
    }

    let input = args.input.join(" ");
    let input = input.trim();
    if input.is_empty() && !args.agent {
        Args::command().print_help()?;
        return Ok(());
    }

    let config = Config::load();

    let provider_name = args
        .provider
        .as_deref()
        .or(config.provider.as_deref())
        .unwrap_or(DEFAULT_PROVIDER);
    let kind: ProviderKind = provider_name.parse()?;

    let catalog = ModelCatalog::builtin().with_overrides(config.providers.clone());
    let model = args
        .model
        .clone()
        .or_else(|| config.model.clone())
        .or_else(|| catalog.default_model(kind.name()).map(String::from))
        .with_context(|| format!("No model configured for provider {}", kind))?;

    let provider = create_provider(kind, config.api_key(kind.name()), config.base_url.as_deref())
        .with_context(|| match kind.api_key_env_var() {
            Some(var) => format!("Failed to set up {} (set {} or api_keys.{})", kind, var, kind),
            None => format!("Failed to set up {}", kind),
        })?;

    tracing::debug!("Using {} model {}", kind, model);

    let reader = StdinReader::new();
    let approval: Arc<dyn CommandApproval> = if args.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(reader.clone())
    };
    let functions = FunctionRegistry::new().with(
        tools::execute_command(),
        Arc::new(ExecuteCommand::new(approval).with_echo(true)),
    );

    let mut engine_config = EngineConfig::new(model.clone()).with_system_prompt(
        config
            .system_prompt
            .clone()
            .unwrap_or_else(|| build_system_prompt(args.agent)),
    );
    if let Some(rounds) = config.max_function_rounds {
        engine_config.max_function_rounds = rounds;
    }
    if let Some(parallel) = config.parallel_function_calls {
        engine_config.parallel_function_calls = parallel;
    }
    let engine = ConversationEngine::new(provider, functions, engine_config);

    let session_config = SessionConfig {
        show_cost: config.show_cost.unwrap_or(false),
        pricing: catalog.pricing(kind.name(), &model),
        ..Default::default()
    };
    let mut display = TerminalDisplay::new();

    if !args.agent {
        run_single_turn(
            &engine,
            input,
            FunctionCallPolicy::Forced(EXECUTE_COMMAND.to_string()),
            &session_config,
            &mut display,
        )
        .await?;
        return Ok(());
    }

    let store = FileThreadStore::open_default()?;
    let session = SessionLoop::new(Arc::new(engine), Arc::new(store), session_config);
    let first = (!input.is_empty()).then(|| input.to_string());
    let mut prompter = InitialInput::new(first, reader);

    println!("Type 'help' for commands, 'exit' to quit.");
    let summary = session
        .run(args.thread.as_deref(), &mut prompter, &mut display)
        .await?;

    if summary.turns > 0 {
        println!(
            "\nSaved as \"{}\". Resume with: ai --agent --thread {}",
            summary.thread_name, summary.thread_id
        );
    }
    Ok(())
}

async fn list_threads() -> anyhow::Result<()> {
    let store = FileThreadStore::open_default()?;
    let threads = store.list_threads().await?;

    if threads.is_empty() {
        println!("No saved threads found.");
        println!("Threads are stored in: {}", store.dir().display());
        return Ok(());
    }

    println!("Saved threads:\n");
    println!("{:<38} {:<18} {:<6} Name", "ID", "Updated", "Msgs");
    println!("{}", "-".repeat(90));
    for thread in threads {
        println!(
            "{:<38} {:<18} {:<6} {}",
            thread.id,
            thread.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            thread.messages.len(),
            utils::truncate_chars(&thread.name, 40)
        );
    }
    println!("\nResume with: ai --agent --thread <id>");
    Ok(())
}

/// System prompt describing the host the commands will run on
fn build_system_prompt(agent: bool) -> String {
    let mut prompt = String::from(
        "You are shai, a terminal assistant that turns requests into shell commands.\n\n",
    );

    prompt.push_str("Tools:\n");
    prompt.push_str(&format!(
        "- {}: Execute a shell command and return its output\n\n",
        EXECUTE_COMMAND
    ));

    prompt.push_str("Guidelines:\n");
    if agent {
        prompt.push_str("- Run commands when they help answer the request\n");
        prompt.push_str("- Summarize command output briefly\n");
    } else {
        prompt.push_str("- Answer with a single command that does what was asked\n");
        prompt.push_str("- After it runs, explain the result in one or two sentences\n");
    }
    prompt.push_str("- Prefer portable commands and avoid destructive ones\n");

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    prompt.push_str(&format!(
        "\nOperating system: {}\nShell: {}\nWorking directory: {}",
        std::env::consts::OS,
        shell,
        cwd
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_one_shot() {
        let args = Args::try_parse_from(["ai", "list", "files", "-y"]).unwrap();
        assert_eq!(args.input, ["list", "files"]);
        assert!(args.yes);
        assert!(!args.agent);
    }

    #[test]
    fn test_args_thread_requires_agent() {
        assert!(Args::try_parse_from(["ai", "--thread", "abc"]).is_err());

        let args = Args::try_parse_from(["ai", "hello", "--agent", "--thread", "abc"]).unwrap();
        assert_eq!(args.thread.as_deref(), Some("abc"));
    }

    #[test]
    fn test_system_prompt_mentions_function() {
        let one_shot = build_system_prompt(false);
        assert!(one_shot.contains(EXECUTE_COMMAND));
        assert!(one_shot.contains("single command"));
        assert!(build_system_prompt(true).contains("Summarize"));
    }

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }
}
