//! Best-effort detection of "server is ready" lines in captured output.
//!
//! Matching is heuristic. The supervisor always falls back to promoting a
//! session after the grace timeout.

use std::sync::Arc;

pub trait ReadyMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// `line` is lowercase with ANSI escapes removed.
    fn is_ready(&self, line: &str) -> bool;
}

/// Ready when any of a fixed set of substrings appears.
pub struct PatternMatcher {
    name: &'static str,
    patterns: &'static [&'static str],
}

impl ReadyMatcher for PatternMatcher {
    fn name(&self) -> &str {
        self.name
    }

    fn is_ready(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| line.contains(p))
    }
}

/// Ready when any inner matcher is.
pub struct AnyMatcher(Vec<Arc<dyn ReadyMatcher>>);

impl ReadyMatcher for AnyMatcher {
    fn name(&self) -> &str {
        "any"
    }

    fn is_ready(&self, line: &str) -> bool {
        self.0.iter().any(|m| m.is_ready(line))
    }
}

const BUILTIN: &[PatternMatcher] = &[
    PatternMatcher {
        name: "next",
        patterns: &["ready started server on", "ready in", "- local:"],
    },
    PatternMatcher {
        name: "vite",
        patterns: &["ready in", "local:   http"],
    },
    PatternMatcher {
        name: "cra",
        patterns: &["compiled successfully", "webpack compiled", "you can now view"],
    },
    PatternMatcher {
        name: "django",
        patterns: &["starting development server at", "quit the server with"],
    },
    PatternMatcher {
        name: "flask",
        patterns: &["running on http", "debugger is active"],
    },
    PatternMatcher {
        name: "rails",
        patterns: &["listening on", "use ctrl-c to stop"],
    },
    PatternMatcher {
        name: "express",
        patterns: &["listening on", "listening at", "server running", "server started", "ready in"],
    },
];

/// Matcher for a framework hint. Unknown or absent hints consult every
/// built-in matcher.
pub fn matcher_for(framework: Option<&str>) -> Arc<dyn ReadyMatcher> {
    if let Some(hint) = framework {
        let hint = hint.to_ascii_lowercase();
        if let Some(found) = BUILTIN.iter().find(|m| m.name == hint) {
            return Arc::new(PatternMatcher {
                name: found.name,
                patterns: found.patterns,
            });
        }
    }
    Arc::new(AnyMatcher(
        BUILTIN
            .iter()
            .map(|m| {
                Arc::new(PatternMatcher {
                    name: m.name,
                    patterns: m.patterns,
                }) as Arc<dyn ReadyMatcher>
            })
            .collect(),
    ))
}

/// Guess the framework from the command line.
pub fn detect_framework(command: &str) -> Option<&'static str> {
    let command = command.to_ascii_lowercase();
    let found = [
        ("next", "next"),
        ("vite", "vite"),
        ("react-scripts", "cra"),
        ("manage.py runserver", "django"),
        ("flask", "flask"),
        ("rails", "rails"),
    ]
    .into_iter()
    .find(|(needle, _)| command.contains(needle))
    .map(|(_, name)| name);
    found
}

/// Remove ANSI escape sequences (CSI and OSC) and lowercase the result.
pub fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            out.extend(ch.to_lowercase());
            continue;
        }
        match chars.next() {
            Some('[') => {
                // CSI: parameters then a final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                // OSC: terminated by BEL or ESC \
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(
            normalize_line("\u{1b}[32m✓\u{1b}[39m Ready in \u{1b}[1m1.2s\u{1b}[22m"),
            "✓ ready in 1.2s"
        );
        assert_eq!(normalize_line("\u{1b}]0;title\u{7}Hello"), "hello");
    }

    #[test]
    fn framework_matchers() {
        let django = matcher_for(Some("django"));
        assert_eq!(django.name(), "django");
        assert!(django.is_ready(&normalize_line(
            "Starting development server at http://127.0.0.1:8000/"
        )));
        assert!(!django.is_ready("compiled successfully"));

        let vite = matcher_for(Some("Vite"));
        assert!(vite.is_ready(&normalize_line("  VITE v5.0.0  ready in 312 ms")));
    }

    #[test]
    fn no_hint_consults_everything() {
        let any = matcher_for(None);
        assert_eq!(any.name(), "any");
        assert!(any.is_ready("server listening on port 3000"));
        assert!(any.is_ready(" * running on http://127.0.0.1:5000"));
        assert!(!any.is_ready("installing dependencies"));
        assert_eq!(matcher_for(Some("unknown")).name(), "any");
    }

    #[test]
    fn detects_framework_from_command() {
        assert_eq!(detect_framework("npx next dev"), Some("next"));
        assert_eq!(detect_framework("python manage.py runserver"), Some("django"));
        assert_eq!(detect_framework("npm start"), None);
    }
}
