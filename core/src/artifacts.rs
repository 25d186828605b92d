//! Staging of inline image attachments onto disk so providers that only
//! accept file paths can see them. Staging is best-effort per item: a
//! payload that fails to decode is skipped with a warning, never fatal.
//! Cleanup removes files first, then the directory, and tolerates both
//! already being gone.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

pub struct StagedArtifacts {
    pub files: Vec<PathBuf>,
    pub dir: Option<PathBuf>,
}

impl StagedArtifacts {
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            dir: None,
        }
    }
}

/// Decode base64 payloads (with or without a `data:...;base64,` prefix)
/// into files under `<root>/<dir_name>/`. Returns the paths that staged
/// successfully; an empty input stages nothing and creates no directory.
pub fn stage_images(root: &Path, dir_name: &str, payloads: &[String]) -> std::io::Result<StagedArtifacts> {
    if payloads.is_empty() {
        return Ok(StagedArtifacts::empty());
    }
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir)?;

    let mut files = Vec::new();
    for (index, payload) in payloads.iter().enumerate() {
        let raw = payload
            .split_once(";base64,")
            .map_or(payload.as_str(), |(_, rest)| rest);
        let bytes = match BASE64.decode(raw.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(index, "skipping undecodable image payload: {err}");
                continue;
            }
        };
        let name = format!("img-{}-{}.{}", index, Uuid::new_v4(), sniff_extension(&bytes));
        let path = dir.join(name);
        match std::fs::write(&path, &bytes) {
            Ok(()) => {
                debug!(path = %path.display(), size = bytes.len(), "staged image");
                files.push(path);
            }
            Err(err) => warn!(index, "failed to write staged image: {err}"),
        }
    }
    Ok(StagedArtifacts {
        files,
        dir: Some(dir),
    })
}

/// Remove staged files, then the staging directory. Both steps are
/// best-effort; a second call on the same set is harmless.
pub fn cleanup(artifacts: &StagedArtifacts) {
    for file in &artifacts.files {
        if let Err(err) = std::fs::remove_file(file)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %file.display(), "failed to remove staged image: {err}");
        }
    }
    if let Some(dir) = &artifacts.dir
        && let Err(err) = std::fs::remove_dir(dir)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %dir.display(), "staging dir not removed: {err}");
    }
}

fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        "jpg"
    } else if bytes.starts_with(b"GIF8") {
        "gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PNG_1X1: &[u8] = &[
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
    ];

    fn encode(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn stages_plain_and_data_url_payloads() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let payloads = vec![
            encode(PNG_1X1),
            format!("data:image/png;base64,{}", encode(PNG_1X1)),
        ];
        let staged = stage_images(tmp.path(), ".relay-images", &payloads).expect("stage");
        assert_eq!(staged.files.len(), 2);
        for file in &staged.files {
            assert!(file.exists());
            assert_eq!(file.extension().and_then(|e| e.to_str()), Some("png"));
        }
    }

    #[test]
    fn bad_payload_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let payloads = vec!["%%%not-base64%%%".to_string(), encode(&[0xff, 0xd8, 0xff, 0xe0])];
        let staged = stage_images(tmp.path(), ".relay-images", &payloads).expect("stage");
        assert_eq!(staged.files.len(), 1);
        assert_eq!(
            staged.files[0].extension().and_then(|e| e.to_str()),
            Some("jpg")
        );
    }

    #[test]
    fn empty_input_creates_no_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staged = stage_images(tmp.path(), ".relay-images", &[]).expect("stage");
        assert!(staged.files.is_empty());
        assert!(staged.dir.is_none());
        assert!(!tmp.path().join(".relay-images").exists());
    }

    #[test]
    fn cleanup_removes_files_then_dir_and_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let payloads = vec![encode(PNG_1X1)];
        let staged = stage_images(tmp.path(), ".relay-images", &payloads).expect("stage");
        let dir = staged.dir.clone().expect("staging dir");
        assert!(dir.exists());
        cleanup(&staged);
        assert!(!dir.exists());
        cleanup(&staged);
    }

    #[test]
    fn unknown_magic_falls_back_to_png() {
        assert_eq!(sniff_extension(b"plain bytes"), "png");
        assert_eq!(sniff_extension(b"GIF89a"), "gif");
        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0, 0, 0, 0]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(sniff_extension(&webp), "webp");
    }
}
