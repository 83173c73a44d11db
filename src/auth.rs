//! Token-file authentication.
//!
//! Tokens live in a newline-delimited file, one `<name> <token>` pair per
//! line with an optional trailing comment. Lines starting with `#` and
//! lines without at least the two fields are skipped with a warning.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// Characters allowed in a token.
const TOKEN_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_=-";

fn valid_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| TOKEN_ALPHABET.contains(c))
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot read token file {path}: {cause}")]
    Unreadable { path: String, cause: String },
}

/// The set of accepted tokens, keyed by token value.
#[derive(Debug, Default, Clone)]
pub struct TokenSet {
    by_token: HashMap<String, String>,
}

impl TokenSet {
    /// Parse a token file.
    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AuthError::Unreadable {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;
        Ok(Self::parse(&text))
    }

    /// Parse token file content. Malformed lines are skipped, not fatal.
    pub fn parse(text: &str) -> Self {
        let mut by_token = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (name, token) = match (fields.next(), fields.next()) {
                (Some(name), Some(token)) => (name, token),
                _ => {
                    warn!(line = lineno + 1, "token line lacks two fields, ignored");
                    continue;
                }
            };
            if !valid_token(token) {
                warn!(line = lineno + 1, name, "token has characters outside the alphabet, ignored");
                continue;
            }
            by_token.insert(token.to_string(), name.to_string());
        }
        Self { by_token }
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Returns the authenticated name for a presented token.
    pub fn authenticate(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(String::as_str)
    }
}

// ============================================================================
// Tests
// ============================================================================
