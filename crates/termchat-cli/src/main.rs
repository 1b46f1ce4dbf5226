//! `termchat`: ask a chat model from the terminal.
//!
//! Usage:
//!   termchat how do I find large files
//!   dmesg | tail -n 40 | termchat what went wrong here
//!   termchat --store-dir ~/.termchat --conversation conv_1234 and then?

use std::io::{IsTerminal as _, Read as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::Parser;
use termchat_core::prelude::*;
use termchat_core::{ConversationStore, init_observability};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "termchat",
    version,
    about = "Stream a chat-model reply into the terminal."
)]
struct Cli {
    /// Prompt to send. Multiple words are joined with spaces.
    #[arg(required = true, value_name = "PROMPT")]
    prompt: Vec<String>,

    /// JSON configuration file. Without it the OpenRouter defaults are used
    /// with the key from $TERMCHAT_API_KEY or $OPENROUTER_API_KEY.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Continue an existing conversation (requires --store-dir).
    #[arg(long, value_name = "ID", requires = "store_dir")]
    conversation: Option<String>,

    /// Directory for conversation logs. Conversations are kept in memory
    /// only when unset.
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// File holding recent terminal output to include in the system prompt.
    #[arg(long, value_name = "FILE")]
    terminal_buffer: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("termchat: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ChatConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ChatConfig::from_env()
            .context("no --config given; set TERMCHAT_API_KEY or OPENROUTER_API_KEY")?,
    };

    let store: Arc<dyn ConversationStore> = match &cli.store_dir {
        Some(dir) => Arc::new(
            JsonlStore::open(dir)
                .with_context(|| format!("failed to open store at {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let mut input = TurnInput::new(cli.prompt.join(" "));
    if let Some(piped) = read_piped_stdin()? {
        input = input.piped_input(piped);
    }
    if let Some(path) = &cli.terminal_buffer {
        let buffer = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read terminal buffer {}", path.display()))?;
        input = input.terminal_buffer(buffer);
    }
    if let Some(id) = cli.conversation {
        input = input.conversation(ConversationId::new(id));
    }
    if input.prompt.trim().is_empty() {
        bail!("prompt must not be empty");
    }

    let mut client = ChatClient::builder(config).store(store).build()?;

    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; aborting turn");
            handle.abort();
        }
    });

    let report = client.send_message(input, signal).await?;
    eprintln!("conversation: {}", report.conversation);
    Ok(())
}

fn read_piped_stdin() -> anyhow::Result<Option<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut text = String::new();
    stdin
        .read_to_string(&mut text)
        .context("failed to read piped input")?;
    Ok(Some(text).filter(|t| !t.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn prompt_words_are_collected() {
        let cli = Cli::try_parse_from(["termchat", "find", "big", "files"]).expect("parse");
        assert_eq!(cli.prompt.join(" "), "find big files");
        assert!(cli.store_dir.is_none());
    }

    #[test]
    fn conversation_requires_store_dir() {
        assert!(Cli::try_parse_from(["termchat", "--conversation", "conv_1", "more"]).is_err());
        let cli = Cli::try_parse_from([
            "termchat",
            "--store-dir",
            "/tmp/chats",
            "--conversation",
            "conv_1",
            "more",
        ])
        .expect("parse");
        assert_eq!(cli.conversation.as_deref(), Some("conv_1"));
    }
}
