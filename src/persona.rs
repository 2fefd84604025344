//! Persona prompt loading.

use std::path::Path;
use tracing::warn;

const DEFAULT_PERSONA: &str = "\
너는 '소리'라는 이름의 음성 비서야. 규칙:
- 한 번에 한두 문장으로 짧게 대답해.
- 음성으로 읽히니까 목록이나 마크다운을 쓰지 마.
- 모르면 모른다고 말해.";

/// Load the persona text from the configured file, falling back to the
/// built-in default when unset or unreadable.
pub fn load_persona(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_PERSONA.to_owned();
    };
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            warn!(path = %path.display(), "persona file is empty, using default");
            DEFAULT_PERSONA.to_owned()
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot read persona file ({e}), using default");
            DEFAULT_PERSONA.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn default_when_unset() {
        assert!(load_persona(None).contains("소리"));
    }

    #[test]
    fn reads_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.txt");
        std::fs::write(&path, "I am a test persona.").unwrap();
        assert_eq!(load_persona(Some(&path)), "I am a test persona.");
    }

    #[test]
    fn empty_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.txt");
        std::fs::write(&path, "   ").unwrap();
        assert!(load_persona(Some(&path)).contains("소리"));
    }
}
