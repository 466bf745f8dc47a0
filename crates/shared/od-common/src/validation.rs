//! Input validation for everything that can reach a shell argument or a
//! persisted identifier. Every caller that spawns `git`, `docker` or
//! `systemctl` must run its inputs through here first.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid git url: {0}")]
    GitUrl(String),
    #[error("invalid branch name: {0}")]
    Branch(String),
    #[error("invalid commit sha: {0}")]
    CommitSha(String),
    #[error("invalid domain: {0}")]
    Domain(String),
    #[error("invalid app name: {0}")]
    AppName(String),
}

const SHELL_META: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '<', '>'];

fn has_shell_meta(s: &str) -> bool {
    s.chars().any(|c| SHELL_META.contains(&c) || c.is_whitespace() || c == '\'' || c == '"')
}

/// Accept `https?|git|ssh|ftps?|rsync://...` or scp-style `user@host:path`.
pub fn validate_git_url(url: &str) -> Result<(), ValidationError> {
    let err = || ValidationError::GitUrl(url.to_string());
    if url.is_empty() || has_shell_meta(url) {
        return Err(err());
    }
    let schemes = ["https://", "http://", "git://", "ssh://", "ftp://", "ftps://", "rsync://"];
    if schemes.iter().any(|s| url.starts_with(s) && url.len() > s.len()) {
        return Ok(());
    }
    // scp-like syntax: user@host:path
    if let Some((userhost, path)) = url.split_once(':') {
        if userhost.contains('@') && !path.is_empty() && !userhost.starts_with('-') {
            return Ok(());
        }
    }
    Err(err())
}

pub fn validate_branch(branch: &str) -> Result<(), ValidationError> {
    if branch.is_empty()
        || branch.starts_with('-')
        || has_shell_meta(branch)
        || branch.contains("..")
    {
        return Err(ValidationError::Branch(branch.to_string()));
    }
    Ok(())
}

/// Abbreviated or full sha: 6 to 40 lowercase hex digits.
pub fn validate_commit_sha(sha: &str) -> Result<(), ValidationError> {
    let ok = (6..=40).contains(&sha.len())
        && sha.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::CommitSha(sha.to_string()))
    }
}

/// Strip protocol and `www.` prefixes, lowercase, trim trailing dot.
pub fn normalize_domain(input: &str) -> String {
    let mut d = input.trim().to_lowercase();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = d.strip_prefix(prefix) {
            d = rest.to_string();
        }
    }
    if let Some(rest) = d.strip_prefix("www.") {
        d = rest.to_string();
    }
    if let Some((host, _)) = d.split_once('/') {
        d = host.to_string();
    }
    d.trim_end_matches('.').to_string()
}

/// A normalized domain is acceptable when it is at least 3 chars, carries no
/// path separators or traversal, and contains a dot (`localhost` excepted).
pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let err = || ValidationError::Domain(domain.to_string());
    if domain.len() < 3 {
        return Err(err());
    }
    if domain.contains('/') || domain.contains('\\') || domain.contains("..") {
        return Err(err());
    }
    if !domain.contains('.') && domain != "localhost" {
        return Err(err());
    }
    if has_shell_meta(domain) {
        return Err(err());
    }
    Ok(())
}

pub fn validate_app_name(name: &str) -> Result<(), ValidationError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::AppName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_urls() {
        assert!(validate_git_url("https://github.com/acme/site.git").is_ok());
        assert!(validate_git_url("git@github.com:acme/site.git").is_ok());
        assert!(validate_git_url("ssh://git@host/repo").is_ok());
        assert!(validate_git_url("https://host/$(rm -rf /)").is_err());
        assert!(validate_git_url("https://host/repo;ls").is_err());
        assert!(validate_git_url("file:///etc/passwd").is_err());
        assert!(validate_git_url("").is_err());
    }

    #[test]
    fn branches() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("feature/login-42").is_ok());
        assert!(validate_branch("-evil").is_err());
        assert!(validate_branch("a;b").is_err());
        assert!(validate_branch("a..b").is_err());
    }

    #[test]
    fn commit_shas() {
        assert!(validate_commit_sha("abcdef0").is_ok());
        assert!(validate_commit_sha(&"a".repeat(40)).is_ok());
        assert!(validate_commit_sha("abcde").is_err());
        assert!(validate_commit_sha("ABCDEF0").is_err());
        assert!(validate_commit_sha("xyz123").is_err());
    }

    #[test]
    fn domain_normalization() {
        assert_eq!(normalize_domain("https://www.Example.COM/path"), "example.com");
        assert_eq!(normalize_domain("  api.example.com.  "), "api.example.com");
        assert_eq!(normalize_domain("www.example.com"), "example.com");
    }

    #[test]
    fn domain_validation() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("localhost").is_ok());
        assert!(validate_domain("ab").is_err());
        assert!(validate_domain("exa/mple.com").is_err());
        assert!(validate_domain("a..b.com").is_err());
        assert!(validate_domain("noDotHere").is_err());
    }

    #[test]
    fn app_names() {
        assert!(validate_app_name("my-app_2").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("-x").is_err());
        assert!(validate_app_name("a b").is_err());
    }
}
