use console::style;
use std::io::{self, Write};

use errand::history::AgentHistory;
use errand::models::content::Content;
use errand::models::message::{Message, MessageContent};
use errand::models::role::Role;

const MAX_ARGUMENTS_CHARS: usize = 200;
const MAX_RESULT_CHARS: usize = 400;

/// Shorten `text` to at most `max_chars` characters, noting how much was cut
pub fn abbreviate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}… ({} more chars)", kept, total - max_chars)
}

fn tool_result_text(contents: &[Content]) -> String {
    contents
        .iter()
        .filter(|c| c.audience().map_or(true, |audience| audience.contains(&Role::User)))
        .map(|c| match c {
            Content::Text(text) => text.text.clone(),
            Content::Image(image) => format!("[image: {}]", image.mime_type),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_message(message: &Message) {
    for content in &message.content {
        match content {
            MessageContent::Text(text) if text.text.trim().is_empty() => {}
            MessageContent::Text(text) => match message.role {
                Role::User => println!("{} {}", style("task").cyan().bold(), text.text),
                Role::Assistant => println!("{}", text.text),
            },
            MessageContent::Image(image) => {
                println!("{}", style(format!("[image: {}]", image.mime_type)).dim());
            }
            MessageContent::ToolRequest(request) => match &request.tool_call {
                Ok(call) => println!(
                    "{} {} {}",
                    style("tool").magenta(),
                    style(&call.name).magenta().bold(),
                    style(abbreviate(&call.arguments.to_string(), MAX_ARGUMENTS_CHARS)).dim()
                ),
                Err(e) => println!("{} {}", style("invalid tool call").red(), e),
            },
            MessageContent::ToolResponse(response) => match &response.tool_result {
                Ok(contents) => println!(
                    "{} {}",
                    style("result").green(),
                    style(abbreviate(&tool_result_text(contents), MAX_RESULT_CHARS)).dim()
                ),
                Err(e) => println!("{} {}", style("error").red().bold(), e),
            },
        }
    }
    // Nothing useful to do if stdout is gone
    let _ = io::stdout().flush();
}

pub fn render_summary(history: &AgentHistory) {
    println!();
    if history.completed {
        println!(
            "{} in {} step(s)",
            style("Done").green().bold(),
            history.steps
        );
    } else {
        println!(
            "{} after {} step(s) without finishing",
            style("Stopped").yellow().bold(),
            history.steps
        );
    }
}
