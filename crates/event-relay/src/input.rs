use serde::Deserialize;

use crate::event::Attributes;

/// One line of newline-delimited JSON read by the relay binary.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    /// `{"type":"track","event":"duel_start","data":{...}}`
    Track {
        event: String,
        #[serde(default)]
        data: Option<Attributes>,
    },
    /// `{"type":"identify","userId":"u-1"}`; a null or missing id clears it.
    Identify {
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },
    /// `{"type":"flush"}`
    Flush,
}

impl Command {
    /// Returns `None` for blank lines. Malformed lines are logged and skipped.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(cmd) => Some(cmd),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed input line");
                None
            }
        }
    }
}
