//! Shared CLI utilities for the strata-diffusion binaries.

pub mod backend;

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::engine::config::default_models_dir;

/// Initialize tracing to stderr.
///
/// Nothing is installed when `disable` is set. Otherwise `RUST_LOG` is
/// honored, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read the prompt from `--prompt`, a file, or stdin, in that order.
///
/// Trailing newlines from files and stdin are dropped.
pub fn read_prompt(
    prompt: Option<&str>,
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<String, String> {
    if let Some(text) = prompt {
        return Ok(text.to_string());
    }

    let text = if let Some(path) = file {
        std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read prompt file '{}': {}", path.display(), e))?
    } else if use_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        buf
    } else {
        return Err("No prompt provided. Use --prompt, --file, or --stdin".to_string());
    };
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

/// The models directory: the explicit flag, else the default location.
pub fn resolve_models_dir(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf).unwrap_or_else(default_models_dir)
}

/// clap value parser for `--output-format`.
pub fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_prompt_from_flag() {
        assert_eq!(read_prompt(Some("a red fox"), None, false).unwrap(), "a red fox");
    }

    #[test]
    fn test_read_prompt_empty_flag_is_allowed() {
        assert_eq!(read_prompt(Some(""), None, false).unwrap(), "");
    }

    #[test]
    fn test_read_prompt_from_file_strips_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "a lighthouse at dusk\n").unwrap();
        assert_eq!(read_prompt(None, Some(&path), false).unwrap(), "a lighthouse at dusk");
    }

    #[test]
    fn test_read_prompt_missing_file() {
        let err = read_prompt(None, Some(Path::new("/nonexistent/prompt.txt")), false).unwrap_err();
        assert!(err.contains("Failed to read prompt file"));
    }

    #[test]
    fn test_read_prompt_no_source() {
        let err = read_prompt(None, None, false).unwrap_err();
        assert!(err.contains("No prompt provided"));
    }

    #[test]
    fn test_flag_takes_priority_over_file() {
        let result = read_prompt(Some("from flag"), Some(Path::new("/nonexistent")), false);
        assert_eq!(result.unwrap(), "from flag");
    }

    #[test]
    fn test_resolve_models_dir_explicit() {
        let dir = Path::new("/tmp/sd15");
        assert_eq!(resolve_models_dir(Some(dir)), PathBuf::from("/tmp/sd15"));
    }

    #[test]
    fn test_validate_output_format() {
        assert!(validate_output_format("json").is_ok());
        assert!(validate_output_format("text").is_ok());
        assert!(validate_output_format("png").unwrap_err().contains("Unknown output format"));
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
