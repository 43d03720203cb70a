//! Debugger keys read from the host's key/value configuration file.
//!
//! The format is the host core's: one `Key "value"` pair per line, `//`
//! comments, unknown keys ignored.

use crate::net::DEFAULT_PORT;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// TCP port the listener binds.
    pub port: u16,
    /// Seconds the embedding glue sleeps after installing the hooks, giving
    /// a client time to attach before scripts start.
    pub wait_time: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: DEFAULT_PORT,
            wait_time: 0.0,
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let mut settings = Settings::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let Some((key, value)) = split_pair(line) else {
                continue;
            };
            match key {
                "DebuggerPort" => {
                    if let Ok(port) = value.parse::<u16>() {
                        settings.port = port;
                    }
                }
                "DebuggerWaitTime" => {
                    if let Ok(wait) = value.parse::<f32>() {
                        settings.wait_time = wait;
                    }
                }
                _ => {}
            }
        }
        settings
    }
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (key, rest) = line.split_once(char::is_whitespace)?;
    let value = rest.trim().trim_matches('"');
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}
