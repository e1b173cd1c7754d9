//! Human and JSON output

use anyhow::Result;
use serde::Serialize;

/// How a command prints its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub const fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }

    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Envelope every JSON response is wrapped in.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub command: &'a str,
    pub data: T,
}

pub fn render_json<T: Serialize>(command: &str, data: T) -> Result<String> {
    Ok(serde_json::to_string_pretty(&Envelope { command, data })?)
}

/// Print `data` as JSON, or the `human` text otherwise.
pub fn emit<T: Serialize>(
    format: OutputFormat,
    command: &str,
    data: T,
    human: impl FnOnce(&T) -> String,
) -> Result<()> {
    let text = if format.is_json() {
        render_json(command, &data)?
    } else {
        human(&data)
    };
    if !text.is_empty() {
        #[allow(clippy::print_stdout)]
        {
            println!("{text}");
        }
    }
    Ok(())
}
