//! Document processing rules sent alongside every file upload.

use std::fmt;
use std::str::FromStr;

use refkb_shared::{RefKbError, Result};
use serde_json::{Value, json};

/// How the service splits an uploaded document into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Automatic,
    Custom,
}

impl FromStr for ProcessMode {
    type Err = RefKbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "custom" => Ok(Self::Custom),
            other => Err(RefKbError::validation(format!(
                "unsupported process_mode: {other} (expected \"automatic\" or \"custom\")"
            ))),
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Segmentation settings used by [`ProcessMode::Custom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation {
    pub separator: String,
    pub max_tokens: u32,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self {
            separator: "###".into(),
            max_tokens: 500,
        }
    }
}

/// Build the `process_rule` object for an upload.
pub fn process_rule(mode: ProcessMode, segmentation: &Segmentation) -> Result<Value> {
    match mode {
        ProcessMode::Automatic => Ok(json!({"mode": "automatic", "rules": {}})),
        ProcessMode::Custom => {
            if segmentation.separator.is_empty() {
                return Err(RefKbError::validation(
                    "custom process_mode requires a non-empty separator",
                ));
            }
            if segmentation.max_tokens == 0 {
                return Err(RefKbError::validation(
                    "custom process_mode requires max_tokens > 0",
                ));
            }
            Ok(json!({
                "mode": "custom",
                "rules": {
                    "pre_processing_rules": [
                        {"id": "remove_extra_spaces", "enabled": true},
                        {"id": "remove_urls_emails", "enabled": true}
                    ],
                    "segmentation": {
                        "separator": segmentation.separator,
                        "max_tokens": segmentation.max_tokens
                    }
                }
            }))
        }
    }
}
