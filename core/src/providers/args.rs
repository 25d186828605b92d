//! Deterministic argument-vector construction, one closed branch per
//! provider. The contract shared by every branch: model override beats the
//! provider default, permission mode expands to either the broad flag or a
//! deduplicated allow-list, resume flags appear only when an external
//! correlation id is known, and the prompt is always the final positional.

use std::path::Path;
use std::path::PathBuf;

use relay_protocol::ProviderKind;

use super::ProviderProfile;
use crate::orchestrator::TurnSettings;

/// Tools that stay enabled in the restricted permission mode no matter
/// what the caller asked for.
pub const CRITICAL_TOOLS: [&str; 4] = ["Read", "Write", "Edit", "Bash"];

pub struct ArgContext<'a> {
    pub settings: &'a TurnSettings,
    pub prompt: &'a str,
    pub external_session_id: Option<&'a str>,
    pub image_paths: &'a [PathBuf],
    pub cwd: &'a Path,
}

pub fn build_args(profile: &ProviderProfile, ctx: &ArgContext<'_>) -> Vec<String> {
    match profile.kind {
        ProviderKind::Claude => claude_args(profile, ctx),
        ProviderKind::Gemini => gemini_args(profile, ctx),
        ProviderKind::Codex => codex_args(profile, ctx),
    }
}

fn model_for<'a>(profile: &'a ProviderProfile, ctx: &'a ArgContext<'_>) -> &'a str {
    ctx.settings
        .model
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(profile.default_model)
}

fn claude_args(profile: &ProviderProfile, ctx: &ArgContext<'_>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    args.push("--model".to_string());
    args.push(model_for(profile, ctx).to_string());

    if ctx.settings.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    } else {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools(&ctx.settings.allowed_tools).join(","));
    }

    if let Some(external_id) = ctx.external_session_id {
        args.push("--resume".to_string());
        args.push(external_id.to_string());
    }

    for path in ctx.image_paths {
        args.push(path.display().to_string());
    }

    args.push(ctx.prompt.to_string());
    args
}

fn gemini_args(profile: &ProviderProfile, ctx: &ArgContext<'_>) -> Vec<String> {
    let mut args = vec!["-m".to_string(), model_for(profile, ctx).to_string()];
    if ctx.settings.skip_permissions {
        args.push("--yolo".to_string());
    }
    args.push(ctx.prompt.to_string());
    args
}

fn codex_args(profile: &ProviderProfile, ctx: &ArgContext<'_>) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--model".to_string(),
        model_for(profile, ctx).to_string(),
        "--skip-git-repo-check".to_string(),
        "-C".to_string(),
        ctx.cwd.display().to_string(),
    ];
    if ctx.settings.skip_permissions {
        args.push("--full-auto".to_string());
    }
    args.push(ctx.prompt.to_string());
    args
}

/// Critical tools first, then caller-supplied tools, order-preserving and
/// deduplicated.
fn allowed_tools(requested: &[String]) -> Vec<String> {
    let mut tools: Vec<String> = CRITICAL_TOOLS.iter().map(|t| (*t).to_string()).collect();
    for tool in requested {
        let tool = tool.trim();
        if !tool.is_empty() && !tools.iter().any(|existing| existing == tool) {
            tools.push(tool.to_string());
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::profile;
    use pretty_assertions::assert_eq;

    fn ctx<'a>(settings: &'a TurnSettings, prompt: &'a str) -> ArgContext<'a> {
        ArgContext {
            settings,
            prompt,
            external_session_id: None,
            image_paths: &[],
            cwd: Path::new("/tmp"),
        }
    }

    #[test]
    fn claude_restricted_mode_dedupes_allow_list() {
        let settings = TurnSettings {
            model: None,
            skip_permissions: false,
            allowed_tools: vec!["Bash".to_string(), "WebSearch".to_string()],
        };
        let args = build_args(profile(ProviderKind::Claude), &ctx(&settings, "hi"));
        let pos = args
            .iter()
            .position(|a| a == "--allowedTools")
            .expect("allow-list flag");
        assert_eq!(args[pos + 1], "Read,Write,Edit,Bash,WebSearch");
        assert_eq!(args.last().map(String::as_str), Some("hi"));
    }

    #[test]
    fn claude_skip_permissions_replaces_allow_list() {
        let settings = TurnSettings {
            model: None,
            skip_permissions: true,
            allowed_tools: vec![],
        };
        let args = build_args(profile(ProviderKind::Claude), &ctx(&settings, "hi"));
        assert!(args.iter().any(|a| a == "--dangerously-skip-permissions"));
        assert!(!args.iter().any(|a| a == "--allowedTools"));
    }

    #[test]
    fn claude_resume_flag_carries_external_id() {
        let settings = TurnSettings::default();
        let mut context = ctx(&settings, "again");
        context.external_session_id = Some("thread-42");
        let args = build_args(profile(ProviderKind::Claude), &context);
        let pos = args.iter().position(|a| a == "--resume").expect("resume");
        assert_eq!(args[pos + 1], "thread-42");
    }

    #[test]
    fn model_override_beats_provider_default() {
        let settings = TurnSettings {
            model: Some("opus".to_string()),
            skip_permissions: false,
            allowed_tools: vec![],
        };
        let args = build_args(profile(ProviderKind::Claude), &ctx(&settings, "hi"));
        let pos = args.iter().position(|a| a == "--model").expect("model flag");
        assert_eq!(args[pos + 1], "opus");
    }

    #[test]
    fn image_paths_precede_the_prompt() {
        let settings = TurnSettings::default();
        let images = vec![PathBuf::from("/tmp/.relay-images/img-0.png")];
        let context = ArgContext {
            settings: &settings,
            prompt: "describe",
            external_session_id: None,
            image_paths: &images,
            cwd: Path::new("/tmp"),
        };
        let args = build_args(profile(ProviderKind::Claude), &context);
        let len = args.len();
        assert_eq!(args[len - 2], "/tmp/.relay-images/img-0.png");
        assert_eq!(args[len - 1], "describe");
    }

    #[test]
    fn codex_args_pin_cwd_and_subcommand() {
        let settings = TurnSettings::default();
        let args = build_args(profile(ProviderKind::Codex), &ctx(&settings, "task"));
        assert_eq!(args[0], "exec");
        let pos = args.iter().position(|a| a == "-C").expect("cwd flag");
        assert_eq!(args[pos + 1], "/tmp");
        assert_eq!(args.last().map(String::as_str), Some("task"));
    }

    #[test]
    fn gemini_yolo_only_with_skip_permissions() {
        let mut settings = TurnSettings::default();
        let args = build_args(profile(ProviderKind::Gemini), &ctx(&settings, "q"));
        assert!(!args.iter().any(|a| a == "--yolo"));
        settings.skip_permissions = true;
        let args = build_args(profile(ProviderKind::Gemini), &ctx(&settings, "q"));
        assert!(args.iter().any(|a| a == "--yolo"));
    }
}
