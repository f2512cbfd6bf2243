//! murmur - stream one assistant turn from the command line

mod config;
mod tools;

use clap::Parser;
use crossterm::style::Stylize;
use murmur_agent::{Chunk, FinishStatus, Orchestrator, ToolOutcome};
use murmur_ai::Message;
use std::io::{self, IsTerminal, Read, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// murmur - streaming completions with inline tool calls
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to send (read from stdin when omitted)
    prompt: Option<String>,

    /// Provider (openai, deepseek, openrouter, ollama, anthropic, google, ...)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Endpoint override
    #[arg(long)]
    base_url: Option<String>,

    /// Reasoning level (off, minimal, low, medium, high)
    #[arg(short, long)]
    reasoning_level: Option<String>,

    #[arg(short, long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// System prompt
    #[arg(short, long)]
    system: Option<String>,

    /// Tool rounds per turn before tool syntax is left as text
    #[arg(long)]
    max_tool_rounds: Option<u32>,

    /// Treat content before the first close marker as reasoning
    #[arg(long)]
    reasoning_before_close: bool,

    /// Do not offer the demo tools
    #[arg(long)]
    no_tools: bool,

    /// Print every chunk as a JSON line
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

impl Args {
    /// CLI flags take precedence over the file
    fn merge_into(&self, mut cfg: config::Config) -> config::Config {
        fn pick<T: Clone>(flag: &Option<T>, file: &mut Option<T>) {
            if flag.is_some() {
                *file = flag.clone();
            }
        }
        pick(&self.provider, &mut cfg.provider);
        pick(&self.model, &mut cfg.model);
        pick(&self.base_url, &mut cfg.base_url);
        pick(&self.reasoning_level, &mut cfg.reasoning_level);
        pick(&self.temperature, &mut cfg.temperature);
        pick(&self.max_tokens, &mut cfg.max_tokens);
        pick(&self.system, &mut cfg.system_prompt);
        pick(&self.max_tool_rounds, &mut cfg.max_tool_rounds);
        cfg.reasoning_before_close |= self.reasoning_before_close;
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("murmur=debug,murmur_ai=debug,murmur_agent=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if args.init_config {
        let path = config::Config::init()?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = args.merge_into(config::Config::load());
    let turn_config = cfg.turn_config()?;
    tracing::debug!(
        "Using {} via {:?} at {}",
        turn_config.model.id,
        turn_config.model.api,
        turn_config.model.base_url
    );

    let backend = match murmur_ai::backend_for(&turn_config.model, cfg.api_key().as_deref()) {
        Ok(backend) => backend,
        Err(murmur_ai::Error::InvalidApiKey) => {
            let var = turn_config.model.api.api_key_env_var();
            eprintln!("Error: No API key found for {}", turn_config.model.api.default_base_url());
            eprintln!("Set your API key with: export {}=your-key", var);
            eprintln!("Or add it to the config file: murmur --init-config");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let mut orchestrator = Orchestrator::new(backend);
    if !args.no_tools {
        orchestrator = orchestrator.with_tools(Arc::new(tools::registry()));
    }

    let prompt = match &args.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut input = String::new();
            io::stdin().read_to_string(&mut input)?;
            input
        }
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("Empty prompt");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = orchestrator.start(vec![Message::user(prompt.trim())], turn_config, tx);

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, cancelling turn");
            cancel.cancel();
        }
    });

    let mut printer = Printer::new(args.json);
    while let Some(chunk) = rx.recv().await {
        printer.print(&chunk)?;
    }

    match handle.wait().await {
        Ok(outcome) if outcome.status == FinishStatus::Cancelled => std::process::exit(130),
        Ok(_) => Ok(()),
        // Already reported through the terminal Error chunk
        Err(murmur_agent::Error::Ai(_)) => std::process::exit(1),
        Err(e) => Err(e.into()),
    }
}

/// Renders chunks: answer text on stdout, everything else on stderr
struct Printer {
    json: bool,
    color: bool,
    thinking: bool,
}

impl Printer {
    fn new(json: bool) -> Self {
        Self {
            json,
            color: io::stderr().is_terminal(),
            thinking: false,
        }
    }

    fn dim(&self, text: &str) -> String {
        if self.color {
            text.dim().to_string()
        } else {
            text.to_string()
        }
    }

    fn print(&mut self, chunk: &Chunk) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(chunk)?);
            return Ok(());
        }

        let mut out = io::stdout();
        match chunk {
            Chunk::ThinkingDelta { text, .. } => {
                self.thinking = true;
                eprint!("{}", self.dim(text));
            }
            Chunk::ThinkingComplete { elapsed_ms, .. } => {
                self.thinking = false;
                eprintln!("{}", self.dim(&format!("\n[thought for {} ms]", elapsed_ms)));
            }
            Chunk::TextDelta { text } => {
                if self.thinking {
                    self.thinking = false;
                    eprintln!();
                }
                print!("{}", text);
                out.flush()?;
            }
            Chunk::ToolCallRequested {
                tool_name,
                arguments,
                ..
            } => {
                eprintln!("{}", self.dim(&format!("\n[{}({})]", tool_name, arguments)));
            }
            Chunk::ToolCallResult {
                tool_name, outcome, ..
            } => {
                let line = match outcome {
                    ToolOutcome::Result(value) => {
                        format!("[{}: {}]", tool_name, truncate_chars(&value.to_string(), 200))
                    }
                    ToolOutcome::Error(message) => format!("[{} failed: {}]", tool_name, message),
                };
                eprintln!("{}", self.dim(&line));
            }
            Chunk::WebSearchComplete { results, source } => {
                let count = results.as_array().map(|r| r.len()).unwrap_or(1);
                eprintln!("{}", self.dim(&format!("[{} search results from {:?}]", count, source)));
            }
            Chunk::TextComplete { .. } => println!(),
            Chunk::BlockComplete {
                usage,
                metrics,
                status,
            } => {
                let status = match status {
                    FinishStatus::Completed => String::new(),
                    other => format!("{:?} | ", other),
                };
                eprintln!(
                    "{}",
                    self.dim(&format!(
                        "[{}Tokens: {} in, {} out | first token {} ms, total {} ms]",
                        status,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        metrics.time_to_first_token_ms,
                        metrics.time_to_completion_ms
                    ))
                );
            }
            Chunk::Error { message, .. } => {
                eprintln!("\nError: {}", message);
            }
        }
        Ok(())
    }
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
