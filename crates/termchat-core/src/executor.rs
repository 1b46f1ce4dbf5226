//! Receivers for extracted `<cmd>` directives.
//!
//! Submission is fire-and-forget: the stream engine never waits for a
//! command to run or inspects its result.

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub trait CommandExecutor: Send + Sync {
    fn submit(&self, command: &str);
}

/// Echoes commands for the user to run; nothing is executed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintExecutor;

impl CommandExecutor for PrintExecutor {
    fn submit(&self, command: &str) {
        println!("\nExecuting command: {command}");
    }
}

/// Forwards commands to a channel owned by the embedding application.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandExecutor for ChannelExecutor {
    fn submit(&self, command: &str) {
        if self.tx.send(command.to_string()).is_err() {
            warn!(command, "command receiver dropped; directive not delivered");
        } else {
            debug!(command, "directive submitted");
        }
    }
}
