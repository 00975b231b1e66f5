//! Hostname detection for the formatter's `host` / `logsource` fields.

use std::env;

use tracing::warn;

/// Returns the machine hostname.
///
/// Tries, in order: the `LOGSTASH_ASYNC_HOSTNAME` override, the `HOSTNAME`
/// environment variable, `gethostname(2)`, and finally the literal
/// `"unknown"`.
#[must_use]
pub(crate) fn hostname() -> String {
    for var in ["LOGSTASH_ASYNC_HOSTNAME", "HOSTNAME"] {
        if let Ok(name) = env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(name) => {
            if let Some(name) = name.to_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        Err(e) => warn!("failed to read system hostname: {e}"),
    }

    "unknown".to_string()
}

/// Returns the fully qualified hostname when the system reports one.
///
/// `gethostname(2)` already yields the FQDN on hosts configured with a
/// domain; otherwise the short hostname is returned unchanged.
#[must_use]
pub(crate) fn fqdn() -> String {
    hostname()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn override_takes_precedence() {
        env::set_var("LOGSTASH_ASYNC_HOSTNAME", "pinned-host");
        assert_eq!(hostname(), "pinned-host");
        assert_eq!(fqdn(), "pinned-host");
        env::remove_var("LOGSTASH_ASYNC_HOSTNAME");
    }
}
