//! Per-peer ignore rules.

use crate::message::SyncMessage;

/// Separator between rules inside the handshake field.
///
/// It cannot appear in an extension, so joined rules split back unambiguously.
pub const RULE_SEPARATOR: char = ';';

/// An ordered, de-duplicated set of file extensions a peer does not want.
///
/// Rules suppress `CreateFile` and `CreateDir` messages whose path extension
/// is in the set. Every rule is checked, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreRules {
    rules: Vec<String>,
}

impl IgnoreRules {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. Leading dots and surrounding whitespace are stripped;
    /// empty rules, rules containing the separator or a path separator,
    /// and duplicates are ignored. Returns true if the rule was added.
    pub fn insert(&mut self, rule: &str) -> bool {
        let rule = rule.trim().trim_start_matches('.');
        if rule.is_empty()
            || rule.contains(RULE_SEPARATOR)
            || rule.contains('/')
            || self.contains(rule)
        {
            return false;
        }
        self.rules.push(rule.to_string());
        true
    }

    /// Parses an ignore-list file: one extension per line, blank lines and
    /// `#` comments skipped.
    pub fn from_lines(text: &str) -> Self {
        let mut rules = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            rules.insert(line);
        }
        rules
    }

    /// Parses the handshake field.
    pub fn from_wire(field: &str) -> Self {
        let mut rules = Self::new();
        for rule in field.split(RULE_SEPARATOR) {
            rules.insert(rule);
        }
        rules
    }

    /// Joins the rules into the handshake field.
    pub fn to_wire(&self) -> String {
        self.rules.join(&RULE_SEPARATOR.to_string())
    }

    /// Returns true if `extension` is one of the rules.
    pub fn contains(&self, extension: &str) -> bool {
        self.rules.iter().any(|r| r == extension)
    }

    /// Returns true if `message` must not be delivered to this peer.
    pub fn suppresses(&self, message: &SyncMessage) -> bool {
        if !message.is_creation() {
            return false;
        }
        message.extension().is_some_and(|ext| self.contains(ext))
    }

    /// Iterates over the rules in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(String::as_str)
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for IgnoreRules {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut rules = Self::new();
        for rule in iter {
            rules.insert(rule);
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> SyncMessage {
        SyncMessage::create_file(path, b"x".to_vec())
    }

    #[test]
    fn every_rule_is_checked() {
        let rules: IgnoreRules = ["tmp", "log"].into_iter().collect();
        assert!(rules.suppresses(&file("x.tmp")));
        assert!(rules.suppresses(&file("y.log")));
        assert!(!rules.suppresses(&file("z.txt")));
        assert!(rules.suppresses(&SyncMessage::CreateDir {
            path: "cache.tmp".into()
        }));
    }

    #[test]
    fn deletes_and_moves_are_never_suppressed() {
        let rules: IgnoreRules = ["tmp"].into_iter().collect();
        assert!(!rules.suppresses(&SyncMessage::DeleteFile {
            path: "x.tmp".into()
        }));
        assert!(!rules.suppresses(&SyncMessage::Move {
            from: "a.txt".into(),
            to: "a.tmp".into()
        }));
    }

    #[test]
    fn extension_match_is_exact() {
        let rules: IgnoreRules = ["tmp"].into_iter().collect();
        assert!(!rules.suppresses(&file("x.tmpl")));
        assert!(!rules.suppresses(&file("notes")));
    }

    #[test]
    fn parses_ignore_file() {
        let rules = IgnoreRules::from_lines("tmp\n.log\n\n# comment\n  swp  \ntmp\n");
        assert_eq!(rules.iter().collect::<Vec<_>>(), vec!["tmp", "log", "swp"]);
    }

    #[test]
    fn wire_form() {
        let rules = IgnoreRules::from_lines("tmp\nlog");
        assert_eq!(rules.to_wire(), "tmp;log");
        assert_eq!(IgnoreRules::from_wire("tmp;log"), rules);
        assert!(IgnoreRules::from_wire("").is_empty());
    }
}
