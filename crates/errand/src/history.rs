use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::models::message::Message;

/// Everything that happened during one agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHistory {
    pub task: String,
    /// The full conversation, starting with the task as a user message
    pub messages: Vec<Message>,
    /// Number of provider completions made
    pub steps: usize,
    /// Text of the last assistant message, if it had any
    pub final_response: Option<String>,
    /// False when the run stopped at the step limit
    pub completed: bool,
}

impl AgentHistory {
    /// Write the conversation as JSON lines, one message per line
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create history file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        for message in &self.messages {
            serde_json::to_writer(&mut writer, message)?;
            writeln!(writer)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Read back messages written by [`AgentHistory::save`]
    pub fn load_messages(path: &Path) -> Result<Vec<Message>> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open history file {}", path.display()))?;
        let mut messages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(&line)?);
        }
        Ok(messages)
    }
}
