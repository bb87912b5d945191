//! Placeholder substitution for the privileged module templates.
//!
//! Substitution is literal: tokens are located by plain string search and
//! values are inserted as-is after escaping, so characters such as `\`, `&`
//! or `$` never act as metacharacters.

use serde::{Deserialize, Serialize};

/// How a value is escaped before it replaces a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscapeRule {
    /// Insert the value unchanged. Used for single-line URLs.
    Verbatim,
    /// The placeholder sits inside a Go raw string literal (backticks).
    ///
    /// Raw strings cannot contain a backtick and silently drop carriage
    /// returns, so both are spliced in as interpreted-string concatenations:
    /// `` a`b `` becomes `` a` + "`" + `b ``. Backslashes and newlines are
    /// kept byte-for-byte since a raw string never interprets them.
    GoRawString,
}

impl EscapeRule {
    /// Escapes `value` for insertion under this rule.
    #[must_use]
    pub fn escape(self, value: &str) -> String {
        match self {
            Self::Verbatim => value.to_string(),
            Self::GoRawString => escape_go_raw(value),
        }
    }
}

fn escape_go_raw(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '`' => out.push_str("` + \"`\" + `"),
            '\r' => out.push_str("` + \"\\r\" + `"),
            other => out.push(other),
        }
    }
    out
}

/// One placeholder and what replaces it.
#[derive(Clone, PartialEq, Eq)]
pub struct Substitution {
    /// The placeholder token, e.g. `__INJECTED_KUBECTL_CONTEXT__`.
    pub token: String,
    /// The raw replacement value.
    pub value: String,
    /// How the value is escaped.
    pub rule: EscapeRule,
}

impl Substitution {
    /// Creates a substitution.
    #[must_use]
    pub fn new(token: impl Into<String>, value: impl Into<String>, rule: EscapeRule) -> Self {
        Self {
            token: token.into(),
            value: value.into(),
            rule,
        }
    }
}

impl std::fmt::Debug for Substitution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substitution")
            .field("token", &self.token)
            .field("value", &"***")
            .field("rule", &self.rule)
            .finish()
    }
}

/// Replaces every placeholder occurrence in `source` in a single pass.
///
/// Inserted values are never rescanned, so a secret that happens to contain
/// another token is left alone.
#[must_use]
pub fn render(source: &str, substitutions: &[Substitution]) -> String {
    let escaped: Vec<(&str, String)> = substitutions
        .iter()
        .filter(|s| !s.token.is_empty())
        .map(|s| (s.token.as_str(), s.rule.escape(&s.value)))
        .collect();

    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    loop {
        let next = escaped
            .iter()
            .filter_map(|(token, value)| rest.find(token).map(|pos| (pos, *token, value)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())));

        match next {
            Some((pos, token, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + token.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// Returns the tokens of `substitutions` that still occur in `source`.
#[must_use]
pub fn remaining_tokens<'a>(source: &str, substitutions: &'a [Substitution]) -> Vec<&'a str> {
    substitutions
        .iter()
        .map(|s| s.token.as_str())
        .filter(|token| source.contains(token))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Evaluates a Go constant expression made of raw and interpreted string
    /// literals joined by `+`, the shape `GoRawString` produces.
    fn decode_go_concat(expr: &str) -> Option<String> {
        let mut out = String::new();
        let mut chars = expr.trim().chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next()? {
                '`' => loop {
                    match chars.next()? {
                        '`' => break,
                        '\r' => {}
                        c => out.push(c),
                    }
                },
                '"' => loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            'r' => out.push('\r'),
                            'n' => out.push('\n'),
                            '\\' => out.push('\\'),
                            '"' => out.push('"'),
                            _ => return None,
                        },
                        '\n' => return None,
                        c => out.push(c),
                    }
                },
                _ => return None,
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                None => return Some(out),
                Some('+') => {}
                Some(_) => return None,
            }
        }
    }

    fn round_trip(value: &str) -> Option<String> {
        let source = "const kube = `__TOKEN__`";
        let rendered = render(source, &[Substitution::new("__TOKEN__", value, EscapeRule::GoRawString)]);
        decode_go_concat(rendered.strip_prefix("const kube = ")?)
    }

    #[test]
    fn test_verbatim_replacement() {
        let rendered = render(
            "url := `__URL__`",
            &[Substitution::new("__URL__", "https://registry.local/a&b\\c", EscapeRule::Verbatim)],
        );
        assert_eq!(rendered, "url := `https://registry.local/a&b\\c`");
    }

    #[test]
    fn test_multiline_with_delimiter_round_trips() {
        let value = "apiVersion: v1\nusers:\n- token: `abc`\\n\n  data: C:\\path\\to\r\n";
        assert_eq!(round_trip(value).as_deref(), Some(value));
    }

    #[test]
    fn test_plain_multiline_stays_single_literal() {
        let value = "line one\nline two\n";
        let rendered = render("`__T__`", &[Substitution::new("__T__", value, EscapeRule::GoRawString)]);
        assert_eq!(rendered, "`line one\nline two\n`");
    }

    #[test]
    fn test_value_is_never_rescanned() {
        let subs = [
            Substitution::new("__A__", "contains __B__", EscapeRule::Verbatim),
            Substitution::new("__B__", "b", EscapeRule::Verbatim),
        ];
        assert_eq!(render("__A__ __B__", &subs), "contains __B__ b");
    }

    #[test]
    fn test_every_occurrence_replaced() {
        let subs = [Substitution::new("__X__", "1", EscapeRule::Verbatim)];
        let rendered = render("__X__-__X__", &subs);
        assert_eq!(rendered, "1-1");
        assert!(remaining_tokens(&rendered, &subs).is_empty());
        assert_eq!(remaining_tokens("__X__", &subs), vec!["__X__"]);
    }

    #[test]
    fn test_debug_hides_value() {
        let sub = Substitution::new("__K__", "hunter2", EscapeRule::Verbatim);
        assert!(!format!("{sub:?}").contains("hunter2"));
    }
}
