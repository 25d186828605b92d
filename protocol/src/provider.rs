use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The closed set of external agent CLIs the relay can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Coding-agent CLI speaking newline-delimited JSON events.
    Claude,
    /// Reasoning-model CLI printing plain text with debug banners.
    Gemini,
    /// Agent CLI decorating its plain-text output with spinners and ANSI.
    Codex,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Claude,
        ProviderKind::Gemini,
        ProviderKind::Codex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Codex => "codex",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown provider `{tag}`")]
pub struct UnknownProviderError {
    pub tag: String,
}

impl FromStr for ProviderKind {
    type Err = UnknownProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(ProviderKind::Claude),
            "gemini" => Ok(ProviderKind::Gemini),
            "codex" => Ok(ProviderKind::Codex),
            _ => Err(UnknownProviderError { tag: s.to_string() }),
        }
    }
}

/// How a provider structures the bytes it writes to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputProtocol {
    /// One JSON event per line; partial lines buffer until complete.
    JsonLines,
    /// Plain text interleaved with known debug/telemetry banners.
    PlainFiltered,
    /// Plain text decorated with ANSI escapes and spinner glyphs.
    PlainSpinner,
}
