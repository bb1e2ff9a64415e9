use courier_domain::MailRecord;
use courier_error::RelayError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RewriteSpec {
    pub regex: String,
    pub replace: String,
}

/// A rule as written in the configuration file. Patterns are unanchored
/// regular expressions; `subjectFilter`/`bodyFilter` only apply to `allow`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleSpec {
    pub cond: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(
        default,
        rename = "subjectFilter",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject_filter: Option<RewriteSpec>,
    #[serde(default, rename = "bodyFilter", skip_serializing_if = "Option::is_none")]
    pub body_filter: Option<RewriteSpec>,
}

#[derive(Debug, Clone)]
pub struct Rewrite {
    pattern: Regex,
    replacement: String,
}

impl Rewrite {
    pub fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, self.replacement.as_str())
            .into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    condition: Condition,
    sender: Option<Regex>,
    subject: Option<Regex>,
    body: Option<Regex>,
    subject_rewrite: Option<Rewrite>,
    body_rewrite: Option<Rewrite>,
    spec: RuleSpec,
}

impl FilterRule {
    pub fn compile(spec: RuleSpec) -> Result<Self, RelayError> {
        Ok(Self {
            condition: spec.cond,
            sender: compile_pattern(spec.from.as_deref(), "from")?,
            subject: compile_pattern(spec.subject.as_deref(), "subject")?,
            body: compile_pattern(spec.body.as_deref(), "body")?,
            subject_rewrite: compile_rewrite(spec.subject_filter.as_ref(), "subjectFilter")?,
            body_rewrite: compile_rewrite(spec.body_filter.as_ref(), "bodyFilter")?,
            spec,
        })
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    /// Every present pattern must be found somewhere in its field.
    pub fn matches(&self, mail: &MailRecord) -> bool {
        if let Some(re) = &self.sender {
            if !re.is_match(&mail.sender) {
                debug!(sender = %mail.sender, pattern = re.as_str(), "filter: sender does not match");
                return false;
            }
        }
        if let Some(re) = &self.subject {
            if !re.is_match(&mail.subject) {
                debug!(subject = %mail.subject, pattern = re.as_str(), "filter: subject does not match");
                return false;
            }
        }
        if let Some(re) = &self.body {
            if !re.is_match(&mail.body) {
                debug!(pattern = re.as_str(), body = ?mail.body, "filter: body does not match");
                return false;
            }
        }
        true
    }

    fn rewrite(&self, mail: &MailRecord) -> MailRecord {
        let mut out = mail.clone();
        if let Some(rw) = &self.subject_rewrite {
            out.subject = rw.apply(&out.subject);
        }
        if let Some(rw) = &self.body_rewrite {
            out.body = rw.apply(&out.body);
        }
        out
    }
}

fn compile_pattern(pattern: Option<&str>, field: &str) -> Result<Option<Regex>, RelayError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| {
                RelayError::config(format!(
                    "invalid `{field}` pattern {p:?}: {e}{}",
                    unsupported_syntax_hint(p)
                ))
            })
        })
        .transpose()
}

/// Patterns are matched with the `regex` crate, which has no look-around and
/// no backreferences; rules relying on either must be rewritten.
fn unsupported_syntax_hint(pattern: &str) -> &'static str {
    let lookaround = ["(?=", "(?!", "(?<=", "(?<!"]
        .iter()
        .any(|tok| pattern.contains(tok));
    let backreference = pattern
        .as_bytes()
        .windows(2)
        .any(|w| w[0] == b'\\' && (b'1'..=b'9').contains(&w[1]))
        || pattern.contains("\\k<");
    if lookaround || backreference {
        " (look-around and backreferences are not supported; rewrite the rule without them)"
    } else {
        ""
    }
}

fn compile_rewrite(spec: Option<&RewriteSpec>, field: &str) -> Result<Option<Rewrite>, RelayError> {
    spec.map(|s| {
        let pattern = Regex::new(&s.regex).map_err(|e| {
            RelayError::config(format!(
                "invalid `{field}` regex {:?}: {e}{}",
                s.regex,
                unsupported_syntax_hint(&s.regex)
            ))
        })?;
        Ok(Rewrite {
            pattern,
            replacement: expand_replacement(&s.replace),
        })
    })
    .transpose()
}

/// Turns a `String.prototype.replace` style template (`$1`, `$&`, `$<name>`,
/// `$$`) into the `regex` crate's syntax. Group numbers are braced so that
/// `$1_X` stays group 1 followed by `_X`; a `$` with nothing to expand is
/// kept literally.
fn expand_replacement(template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 4);
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(d) if d.is_ascii_digit() => {
                let mut group = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    if group.len() == 2 {
                        break;
                    }
                    group.push(d);
                    chars.next();
                }
                if group.bytes().all(|b| b == b'0') {
                    out.push_str(&format!("$${group}"));
                } else {
                    out.push_str(&format!("${{{group}}}"));
                }
            }
            Some('<') => {
                let rest: String = chars.clone().skip(1).collect();
                match rest.find('>') {
                    Some(end) if end > 0 => {
                        out.push_str(&format!("${{{}}}", &rest[..end]));
                        for _ in 0..rest[..end].chars().count() + 2 {
                            chars.next();
                        }
                    }
                    _ => out.push_str("$$"),
                }
            }
            _ => out.push_str("$$"),
        }
    }
    out
}

/// First matching rule decides: `deny` drops the mail, `allow` returns a copy
/// with its rewrites applied. With no match the mail passes unchanged.
pub fn evaluate(rules: &[FilterRule], mail: &MailRecord) -> Option<MailRecord> {
    for (index, rule) in rules.iter().enumerate() {
        if !rule.matches(mail) {
            continue;
        }
        debug!(
            index,
            rule = %serde_json::to_string(rule.spec()).unwrap_or_default(),
            "filter: matched rule"
        );
        return match rule.condition {
            Condition::Allow => Some(rule.rewrite(mail)),
            Condition::Deny => None,
        };
    }
    Some(mail.clone())
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<FilterRule>,
}

impl RuleSet {
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, RelayError> {
        let rules = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                FilterRule::compile(spec.clone())
                    .map_err(|e| RelayError::config(format!("filter[{i}]: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn evaluate(&self, mail: &MailRecord) -> Option<MailRecord> {
        evaluate(&self.rules, mail)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
