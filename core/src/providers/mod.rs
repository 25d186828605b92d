//! Static per-provider descriptions: how to find the binary, how to talk
//! to it, and how patient to be before declaring it unresponsive.

mod args;

pub use args::ArgContext;
pub use args::CRITICAL_TOOLS;
pub use args::build_args;

use std::path::PathBuf;
use std::time::Duration;

use relay_protocol::OutputProtocol;
use relay_protocol::ProviderKind;

use crate::error::RelayErr;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub kind: ProviderKind,
    /// Program name looked up on PATH when no env override is set.
    pub program: &'static str,
    /// Environment variable naming an explicit binary path.
    pub bin_env: &'static str,
    pub default_model: &'static str,
    /// First-output guard: how long to wait for *any* stdout before
    /// declaring the process unresponsive. Not a total-turn deadline.
    pub first_output_timeout: Duration,
    /// Directory name (under the working directory) for staged images.
    pub staging_dir_name: &'static str,
    pub protocol: OutputProtocol,
    pub supports_images: bool,
    /// Whether the provider resumes a conversation natively via an
    /// external correlation id instead of a replayed transcript.
    pub native_resume: bool,
    /// Whether the provider reports its own errors inside stdout; if so,
    /// stderr is accumulated silently and surfaced only on non-zero exit.
    pub structured_stderr: bool,
    /// Whether chunks stream to the sink live or only at end-of-turn.
    pub streams_live: bool,
}

static CLAUDE: ProviderProfile = ProviderProfile {
    kind: ProviderKind::Claude,
    program: "claude",
    bin_env: "RELAY_CLAUDE_BIN",
    default_model: "sonnet",
    first_output_timeout: Duration::from_secs(300),
    staging_dir_name: ".relay-images",
    protocol: OutputProtocol::JsonLines,
    supports_images: true,
    native_resume: true,
    structured_stderr: true,
    streams_live: true,
};

static GEMINI: ProviderProfile = ProviderProfile {
    kind: ProviderKind::Gemini,
    program: "gemini",
    bin_env: "RELAY_GEMINI_BIN",
    default_model: "gemini-2.5-pro",
    first_output_timeout: Duration::from_secs(120),
    staging_dir_name: ".relay-images",
    protocol: OutputProtocol::PlainFiltered,
    supports_images: false,
    native_resume: false,
    structured_stderr: false,
    streams_live: true,
};

static CODEX: ProviderProfile = ProviderProfile {
    kind: ProviderKind::Codex,
    program: "codex",
    bin_env: "RELAY_CODEX_BIN",
    default_model: "gpt-5-codex",
    first_output_timeout: Duration::from_secs(300),
    staging_dir_name: ".relay-images",
    protocol: OutputProtocol::PlainSpinner,
    supports_images: false,
    native_resume: false,
    structured_stderr: false,
    streams_live: false,
};

pub fn profile(kind: ProviderKind) -> &'static ProviderProfile {
    match kind {
        ProviderKind::Claude => &CLAUDE,
        ProviderKind::Gemini => &GEMINI,
        ProviderKind::Codex => &CODEX,
    }
}

pub fn resolve(tag: &str) -> Result<&'static ProviderProfile> {
    let kind = tag
        .parse::<ProviderKind>()
        .map_err(|err| RelayErr::UnknownProvider { tag: err.tag })?;
    Ok(profile(kind))
}

impl ProviderProfile {
    /// Env override wins; otherwise a PATH lookup, falling back to the
    /// bare program name so the spawn error names the missing binary.
    pub fn executable(&self) -> PathBuf {
        if let Ok(path) = std::env::var(self.bin_env)
            && !path.trim().is_empty()
        {
            return PathBuf::from(path);
        }
        which::which(self.program).unwrap_or_else(|_| PathBuf::from(self.program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolve_known_tags() {
        assert_eq!(resolve("claude").expect("claude").kind, ProviderKind::Claude);
        assert_eq!(resolve("gemini").expect("gemini").kind, ProviderKind::Gemini);
        assert_eq!(resolve("codex").expect("codex").kind, ProviderKind::Codex);
    }

    #[test]
    fn resolve_unknown_tag_is_an_error() {
        let err = resolve("cursor").expect_err("should reject");
        assert_eq!(err.to_string(), "unknown provider `cursor`");
    }

    #[test]
    fn every_provider_has_a_distinct_protocol_and_env() {
        let profiles: Vec<_> = ProviderKind::ALL.iter().map(|kind| profile(*kind)).collect();
        for (i, a) in profiles.iter().enumerate() {
            for b in profiles.iter().skip(i + 1) {
                assert_ne!(a.bin_env, b.bin_env);
            }
        }
    }
}
