//! ACME HTTP-01 challenge files.

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Serve a challenge token from the configured directory. Returns the
/// file contents, `Some(None)` for an unknown token, and `None` when
/// the path is not a challenge request at all.
pub async fn try_serve(path: &str, challenge_dir: &str) -> Option<Option<Vec<u8>>> {
    let token = path.strip_prefix(CHALLENGE_PREFIX)?;
    // Tokens are single path components; anything else is a traversal
    // attempt.
    if token.is_empty() || token.contains('/') || token.contains("..") {
        return Some(None);
    }
    let full = std::path::Path::new(challenge_dir).join(token);
    match tokio::fs::read(&full).await {
        Ok(contents) => Some(Some(contents)),
        Err(_) => Some(None),
    }
}
