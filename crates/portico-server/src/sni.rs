//! SNI classification from certificate SAN hostnames.
//!
//! The serving certificate carries a mix of exact DNS names and `*.suffix`
//! wildcards. Both sets compile into one anchored, case-insensitive
//! alternation each; the wildcard's left label is restricted to
//! `[a-z0-9_-]*`. Matching an inbound SNI against the pair decides whether
//! the leftmost label is resolver metadata (a `flag`) or part of the host.

use regex::Regex;

use crate::{Result, ServerError};

/// Metadata extracted from a matched SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniMetadata {
    /// Leftmost label of a wildcard match; opaque to this layer.
    pub flag: String,
    /// Hostname handed to the resolver.
    pub host: String,
}

/// Compiled SAN matcher.
///
/// Built once per process; an empty SAN set yields a matcher that refuses
/// every name.
#[derive(Debug)]
pub struct SniMatcher {
    exact: Option<Regex>,
    wildcard: Option<Regex>,
}

impl SniMatcher {
    /// Compiles the matcher from DNS SAN entries.
    ///
    /// Entries beginning with `*` are wildcards; everything else is exact.
    /// A wildcard's bare suffix also counts as an exact name, so
    /// `*.b.example` admits `b.example` itself without a flag.
    pub fn from_sans(sans: &[String]) -> Result<Self> {
        let mut exact = Vec::new();
        let mut wildcard = Vec::new();

        for san in sans {
            let escaped = san.replace('.', r"\.");
            if let Some(suffix) = escaped.strip_prefix('*') {
                wildcard.push(format!("[a-z0-9_-]*{suffix}"));
                if let Some(bare) = suffix.strip_prefix(r"\.") {
                    exact.push(bare.to_string());
                }
            } else {
                exact.push(escaped);
            }
        }

        Ok(Self {
            exact: compile_alternation(&exact)?,
            wildcard: compile_alternation(&wildcard)?,
        })
    }

    /// True when the SNI equals one of the exact SAN names.
    pub fn is_exact(&self, sni: &str) -> bool {
        self.exact.as_ref().is_some_and(|re| re.is_match(sni))
    }

    /// True when the SNI falls under one of the wildcard SANs.
    pub fn is_wildcard(&self, sni: &str) -> bool {
        self.wildcard.as_ref().is_some_and(|re| re.is_match(sni))
    }

    /// Classifies an SNI, returning the resolver metadata for it.
    ///
    /// Exact matches carry no flag. Wildcard matches split the leftmost
    /// label off as the flag. Unknown names return `None` and the caller
    /// closes the connection.
    pub fn classify(&self, sni: &str) -> Option<SniMetadata> {
        if self.is_exact(sni) {
            return Some(SniMetadata {
                flag: String::new(),
                host: sni.to_string(),
            });
        }

        if self.is_wildcard(sni) {
            return Some(metadata(sni));
        }

        None
    }
}

/// Splits an SNI into `flag` and `host`.
///
/// More than two labels: the first label is the flag and the rest joined is
/// the host. Otherwise the whole name is the host.
pub fn metadata(sni: &str) -> SniMetadata {
    let labels: Vec<&str> = sni.split('.').collect();
    if labels.len() > 2 {
        SniMetadata {
            flag: labels[0].to_string(),
            host: labels[1..].join("."),
        }
    } else {
        SniMetadata {
            flag: String::new(),
            host: sni.to_string(),
        }
    }
}

/// Compiles an anchored case-insensitive alternation; `None` never matches.
fn compile_alternation(patterns: &[String]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let source = format!("(?i)^(?:{})$", patterns.join("|"));
    Regex::new(&source)
        .map(Some)
        .map_err(|e| ServerError::Config(format!("bad SAN pattern: {e}")))
}
