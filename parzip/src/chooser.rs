//! Compression-method policy.
//!
//! The chooser only looks at what is known before any compression happens:
//! the archive name, the size recorded at map time, and a sniff of the first
//! bytes. It never trial-compresses. Falling back to `Store` after the fact
//! (when compression grew the payload) is the planner's job; the chooser
//! just supplies the predicate.

use crate::ArchiveError;

/// A compression decision for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Store,
    Deflate { level: u32 },
    Zstd { level: i32 },
}

#[derive(Debug)]
enum Matcher {
    /// Case-insensitive extension match, without the dot.
    Extension(String),
    /// Glob over the whole archive name; `*`/`?` stop at `/`, `**` does not.
    Glob(fancy_regex::Regex),
    /// Matches entries of at least this many bytes.
    MinSize(u64),
}

#[derive(Debug)]
pub struct Rule {
    matcher: Matcher,
    decision: Decision,
}

impl Rule {
    pub fn extension(ext: &str, decision: Decision) -> Rule {
        Rule {
            matcher: Matcher::Extension(ext.trim_start_matches('.').to_ascii_lowercase()),
            decision,
        }
    }

    pub fn glob(pattern: &str, decision: Decision) -> Result<Rule, ArchiveError> {
        let regex = fancy_regex::Regex::new(&glob_to_regex(pattern))
            .map_err(|_| ArchiveError::BadRule("glob pattern does not compile"))?;
        Ok(Rule {
            matcher: Matcher::Glob(regex),
            decision,
        })
    }

    pub fn min_size(bytes: u64, decision: Decision) -> Rule {
        Rule {
            matcher: Matcher::MinSize(bytes),
            decision,
        }
    }

    fn matches(&self, name: &str, size: u64) -> bool {
        match &self.matcher {
            Matcher::Extension(ext) => name
                .rsplit_once('.')
                .is_some_and(|(_, e)| e.eq_ignore_ascii_case(ext)),
            Matcher::Glob(regex) => regex.is_match(name).unwrap_or(false),
            Matcher::MinSize(bytes) => size >= *bytes,
        }
    }
}

/// Ordered rule list; the first matching rule wins, the default applies when
/// none match.
#[derive(Debug)]
pub struct Chooser {
    rules: Vec<Rule>,
    default: Decision,
}

/// Below this size the built-in rules store rather than deflate; deflate
/// reliably grows very small inputs.
const STORE_BELOW: u64 = 5 * 1024;

impl Default for Chooser {
    fn default() -> Self {
        Chooser {
            rules: vec![
                Rule::extension("zip", Decision::Store),
                Rule::min_size(STORE_BELOW, Decision::Deflate { level: 6 }),
            ],
            default: Decision::Store,
        }
    }
}

impl Chooser {
    pub fn new(default: Decision) -> Chooser {
        Chooser {
            rules: Vec::new(),
            default,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Chooser {
        self.rules.push(rule);
        self
    }

    /// Pick a method for an entry. `sample` holds the first bytes of the
    /// payload (up to 16 KiB); the built-in rule forms do not consume it.
    pub fn choose(&self, name: &str, size: u64, _sample: &[u8]) -> Decision {
        for rule in &self.rules {
            if rule.matches(name, size) {
                return rule.decision;
            }
        }
        self.default
    }

    /// Downgrade predicate, consulted by the planner after compression.
    pub fn should_store_instead(compressed_size: u64, uncompressed_size: u64) -> bool {
        compressed_size >= uncompressed_size
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            c if "\\.+()[]{}|^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}
