//! Credential-file discovery.
//!
//! Token files live under `~/.routecodex/auth/` and follow the grammar
//! `<provider>-oauth[-<seq>][-<alias>].json`. The provider prefix `gemini`
//! is normalized to `gemini-cli`. Provider-declared `tokenFile` paths are
//! merged in by the daemon; discovery only covers the auth directory.

use std::path::{Path, PathBuf};

/// One discovered credential file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCredential {
    pub provider: String,
    /// Alias the store keys this credential under (`key<seq>`, the explicit
    /// alias, or `key1`).
    pub alias: String,
    pub path: PathBuf,
}

/// Parse a token filename. Returns `None` for files that do not match the
/// grammar.
pub fn parse_credential_filename(name: &str) -> Option<(String, String)> {
    let stem = name.strip_suffix(".json")?;
    let (provider, rest) = match stem.find("-oauth") {
        Some(idx) => (&stem[..idx], &stem[idx + "-oauth".len()..]),
        None => return None,
    };
    if provider.is_empty() {
        return None;
    }

    let provider = normalize_provider(provider);

    // rest is "", "-<seq>", "-<alias>", or "-<seq>-<alias>".
    let parts: Vec<&str> = rest
        .strip_prefix('-')
        .map(|r| r.split('-').collect())
        .unwrap_or_default();

    let alias = match parts.as_slice() {
        [] => "key1".to_string(),
        [one] => {
            if let Ok(seq) = one.parse::<u32>() {
                format!("key{seq}")
            } else if is_alias(one) {
                one.to_string()
            } else {
                return None;
            }
        }
        [seq, alias] => {
            seq.parse::<u32>().ok()?;
            if !is_alias(alias) {
                return None;
            }
            alias.to_string()
        }
        _ => return None,
    };

    Some((provider, alias))
}

fn is_alias(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// `gemini` auth files belong to the `gemini-cli` provider.
pub fn normalize_provider(provider: &str) -> String {
    if provider == "gemini" {
        "gemini-cli".to_string()
    } else {
        provider.to_string()
    }
}

/// Scan the auth directory for token files.
pub fn scan_auth_dir(dir: &Path) -> Vec<DiscoveredCredential> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((provider, alias)) = parse_credential_filename(name) {
            out.push(DiscoveredCredential {
                provider,
                alias,
                path,
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_provider_file() {
        assert_eq!(
            parse_credential_filename("qwen-oauth.json"),
            Some(("qwen".into(), "key1".into()))
        );
    }

    #[test]
    fn parses_sequence_form() {
        assert_eq!(
            parse_credential_filename("qwen-oauth-2.json"),
            Some(("qwen".into(), "key2".into()))
        );
    }

    #[test]
    fn parses_sequence_and_alias_form() {
        assert_eq!(
            parse_credential_filename("iflow-oauth-1-key3.json"),
            Some(("iflow".into(), "key3".into()))
        );
    }

    #[test]
    fn parses_alias_only_form() {
        assert_eq!(
            parse_credential_filename("qwen-oauth-work.json"),
            Some(("qwen".into(), "work".into()))
        );
    }

    #[test]
    fn normalizes_gemini_prefix() {
        assert_eq!(
            parse_credential_filename("gemini-oauth.json"),
            Some(("gemini-cli".into(), "key1".into()))
        );
    }

    #[test]
    fn rejects_non_matching_names() {
        assert_eq!(parse_credential_filename("config.json"), None);
        assert_eq!(parse_credential_filename("qwen-oauth.txt"), None);
        assert_eq!(parse_credential_filename("-oauth.json"), None);
        assert_eq!(parse_credential_filename("qwen-oauth-1-key2-extra.json"), None);
    }

    #[test]
    fn scans_directory_for_token_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qwen-oauth.json"), "{}").unwrap();
        std::fs::write(dir.path().join("gemini-oauth-2.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let found = scan_auth_dir(dir.path());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].provider, "gemini-cli");
        assert_eq!(found[0].alias, "key2");
        assert_eq!(found[1].provider, "qwen");
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        assert!(scan_auth_dir(Path::new("/nonexistent/rcx-auth")).is_empty());
    }
}
