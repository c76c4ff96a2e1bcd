//! Remote URL screening, run before every push and pull.
//!
//! Accepted:
//! - SSH shorthand: `user@host:path` (and `ssh://` URLs)
//! - `https://` URLs
//! - `file://` URLs and absolute local paths
//!
//! Everything else is rejected, with the offending scheme named in the error.

use std::path::Path;

use crate::error::TransportError;

const INSECURE_SCHEMES: &[&str] = &["http", "git", "ftp", "ftps", "rsync", "telnet"];

/// Check that `url` uses an encrypted transport or never leaves the machine.
pub fn validate_remote_url(url: &str) -> Result<(), TransportError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(TransportError::Empty);
    }

    if let Some((scheme, rest)) = url.split_once("://") {
        let scheme = scheme.to_ascii_lowercase();
        if !is_scheme_token(&scheme) {
            return Err(TransportError::Malformed(url.to_string()));
        }

        return match scheme.as_str() {
            "https" | "ssh" | "git+ssh" | "ssh+git" => {
                if host_of(rest).is_empty() {
                    Err(TransportError::Malformed(url.to_string()))
                } else {
                    Ok(())
                }
            }
            "file" => {
                if rest.is_empty() {
                    Err(TransportError::Malformed(url.to_string()))
                } else {
                    Ok(())
                }
            }
            s if INSECURE_SCHEMES.contains(&s) => Err(TransportError::InsecureScheme {
                scheme,
                url: url.to_string(),
            }),
            _ => Err(TransportError::UnsupportedScheme {
                scheme,
                url: url.to_string(),
            }),
        };
    }

    if Path::new(url).is_absolute() {
        return Ok(());
    }

    if is_scp_like(url) {
        return Ok(());
    }

    Err(TransportError::Malformed(url.to_string()))
}

fn is_scheme_token(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn host_of(rest: &str) -> &str {
    let authority = rest.split('/').next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default()
}

// `user@host:path`, the form git treats as SSH.
fn is_scp_like(url: &str) -> bool {
    let Some((user_host, path)) = url.split_once(':') else {
        return false;
    };
    let Some((user, host)) = user_host.split_once('@') else {
        return false;
    };

    !user.is_empty()
        && !host.is_empty()
        && !path.is_empty()
        && !host.contains('/')
        && !user.contains(char::is_whitespace)
        && !host.contains(char::is_whitespace)
}
