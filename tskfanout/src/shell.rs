//! Shared POSIX-shell-like tokenizer for backend `enable(options)` strings, shared by
//! every backend so none of them hand-roll quote handling.

use crate::error::{Result, TimeseriesError};

/// Caps the number of tokens a single `enable()` call will honor, per the design doc.
pub const MAX_TOKENS: usize = 1024;

/// Tokenises `s` the way a POSIX shell would (respecting single and double quotes),
/// refusing inputs that would produce more than [`MAX_TOKENS`] tokens.
pub fn tokenize(s: &str) -> Result<Vec<String>> {
    let tokens = shell_words::split(s)
        .map_err(|e| TimeseriesError::Config(format!("invalid option string `{s}`: {e}")))?;

    if tokens.len() > MAX_TOKENS {
        return Err(TimeseriesError::Config(format!(
            "option string `{s}` exceeds the {MAX_TOKENS}-token limit"
        )));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_tokens() {
        assert_eq!(tokenize("-c 5 -f out.gz").unwrap(), vec!["-c", "5", "-f", "out.gz"]);
    }

    #[test]
    fn respects_quotes() {
        assert_eq!(
            tokenize(r#"-f "/tmp/my file.gz""#).unwrap(),
            vec!["-f", "/tmp/my file.gz"]
        );
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        assert!(tokenize(r#"-f "unterminated"#).is_err());
    }

    #[test]
    fn rejects_too_many_tokens() {
        let many = "a ".repeat(MAX_TOKENS + 1);
        assert!(tokenize(&many).is_err());
    }
}
