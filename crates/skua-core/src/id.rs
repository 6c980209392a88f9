//! Hierarchical virtual-machine identifiers.
//!
//! A [`VmId`] is an ordered sequence of labels forming a path, written
//! `tenant/group/vm`. The path of a certificate's issuers (root excluded) is
//! the *prefix* of everything that tenant may touch; the leaf common name is
//! the VM's *name*. Identifiers are unique among live VMs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between labels in the textual form.
pub const SEPARATOR: char = '/';

/// Maximum number of labels in an identifier.
///
/// Bounds recursion in the admission walk and keeps image file names sane.
pub const MAX_DEPTH: usize = 16;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 64;

/// Errors produced when parsing or constructing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IdError {
    /// The identifier contained no labels.
    #[error("empty identifier")]
    Empty,

    /// A label was empty or contained a forbidden character.
    #[error("invalid label {0:?}")]
    InvalidLabel(String),

    /// The identifier exceeded [`MAX_DEPTH`] labels.
    #[error("identifier deeper than {MAX_DEPTH} labels")]
    TooDeep,
}

/// Validates a single label.
///
/// Labels are non-empty ASCII alphanumerics plus `-` and `_`, at most
/// [`MAX_LABEL_LEN`] bytes. Dots are excluded so the dot-joined image file
/// name of a VM cannot collide with another VM's.
fn check_label(label: &str) -> Result<(), IdError> {
    if label.is_empty()
        || label.len() > MAX_LABEL_LEN
        || !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(IdError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// A path-shaped VM identifier.
///
/// The full id of a VM is its certificate prefix with the leaf name
/// appended. Equality and hashing are label-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmId {
    labels: Vec<String>,
}

impl VmId {
    /// Builds an identifier from labels, validating each one.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the sequence is empty, too deep, or any label
    /// is malformed.
    pub fn new<I, S>(labels: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(IdError::Empty);
        }
        if labels.len() > MAX_DEPTH {
            return Err(IdError::TooDeep);
        }
        for label in &labels {
            check_label(label)?;
        }
        Ok(Self { labels })
    }

    /// Builds the full id of a VM from its certificate prefix and leaf name.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the combined path is invalid.
    pub fn from_prefix(prefix: &[String], name: &str) -> Result<Self, IdError> {
        Self::new(prefix.iter().map(String::as_str).chain(Some(name)))
    }

    /// The labels of this identifier, root-most first.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The leaf label (the VM name).
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.last().expect("VmId is never empty")
    }

    /// Number of labels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if `prefix` is a (possibly empty) leading subsequence
    /// of this identifier's labels.
    #[must_use]
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.labels.len() >= prefix.len() && self.labels[..prefix.len()] == *prefix
    }

    /// The dot-joined file stem used for on-disk artifacts of this VM.
    ///
    /// Labels cannot contain dots, so distinct ids map to distinct stems.
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.labels.join(".")
    }

    /// Matches this identifier against a glob, evaluated under `prefix`.
    ///
    /// The glob applies to the labels *below* the prefix and selects a
    /// subtree: an id matches when every glob segment matches the
    /// corresponding label. An empty glob matches the whole subtree. A `*`
    /// segment matches exactly one label, except in final position where it
    /// matches one or more remaining labels. Ids outside `prefix` never
    /// match.
    #[must_use]
    pub fn matches_glob(&self, prefix: &[String], glob: &str) -> bool {
        if !self.starts_with(prefix) {
            return false;
        }
        let rest = &self.labels[prefix.len()..];
        if glob.is_empty() {
            return true;
        }
        let pattern: Vec<&str> = glob.split(SEPARATOR).collect();
        if pattern.len() > rest.len() {
            return false;
        }
        for (i, seg) in pattern.iter().enumerate() {
            let last = i + 1 == pattern.len();
            if last && *seg == "*" {
                // trailing wildcard swallows the remaining labels
                return rest.len() > i;
            }
            if *seg != "*" && rest.get(i).map(String::as_str) != Some(*seg) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels.join("/"))
    }
}

impl FromStr for VmId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(SEPARATOR))
    }
}

impl TryFrom<String> for VmId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let id: VmId = "tenant/group/vm1".parse().unwrap();
        assert_eq!(id.labels().len(), 3);
        assert_eq!(id.name(), "vm1");
        assert_eq!(id.to_string(), "tenant/group/vm1");
    }

    #[test]
    fn rejects_empty_and_bad_labels() {
        assert!("".parse::<VmId>().is_err());
        assert!("a//b".parse::<VmId>().is_err());
        assert!("a/b.c".parse::<VmId>().is_err());
        assert!("a/b c".parse::<VmId>().is_err());
    }

    #[test]
    fn rejects_excessive_depth() {
        let deep = vec!["x"; MAX_DEPTH + 1].join("/");
        assert_eq!(deep.parse::<VmId>(), Err(IdError::TooDeep));
    }

    #[test]
    fn prefix_relation() {
        let id: VmId = "tenant/group/vm1".parse().unwrap();
        let prefix = vec!["tenant".to_string()];
        assert!(id.starts_with(&prefix));
        assert!(id.starts_with(&[]));
        assert!(!id.starts_with(&["other".to_string()]));
    }

    #[test]
    fn file_stem_is_dot_joined() {
        let id: VmId = "t/g/v".parse().unwrap();
        assert_eq!(id.file_stem(), "t.g.v");
    }

    #[test]
    fn glob_empty_matches_subtree() {
        let id: VmId = "tenant/group/vm1".parse().unwrap();
        assert!(id.matches_glob(&["tenant".to_string()], ""));
        assert!(!id.matches_glob(&["other".to_string()], ""));
    }

    #[test]
    fn glob_star_matches_one_label() {
        let id: VmId = "tenant/group/vm1".parse().unwrap();
        let prefix = vec!["tenant".to_string()];
        assert!(id.matches_glob(&prefix, "group/vm1"));
        assert!(id.matches_glob(&prefix, "*/vm1"));
        assert!(id.matches_glob(&prefix, "group/*"));
        assert!(!id.matches_glob(&prefix, "vm1"));
    }

    #[test]
    fn glob_selects_subtree() {
        let id: VmId = "tenant/group/sub/vm1".parse().unwrap();
        let prefix = vec!["tenant".to_string()];
        assert!(id.matches_glob(&prefix, "group"));
        assert!(id.matches_glob(&prefix, "group/sub"));
        assert!(!id.matches_glob(&prefix, "other"));
    }

    #[test]
    fn trailing_star_matches_remaining_suffix() {
        let id: VmId = "tenant/group/sub/vm1".parse().unwrap();
        let prefix = vec!["tenant".to_string()];
        assert!(id.matches_glob(&prefix, "group/*"));
        assert!(id.matches_glob(&prefix, "*"));
        let shallow: VmId = "tenant".parse().unwrap();
        assert!(!shallow.matches_glob(&prefix, "*"));
    }
}
