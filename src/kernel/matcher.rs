//! Kernel mapping selection
//!
//! Walks the ordered rule list of a module and returns the first rule that
//! applies to a kernel version. A rule either names one exact version
//! (`literal`) or a regular expression searched anywhere in the version
//! (`regexp`).

use super::version::KernelVersion;
use crate::crd::KernelMapping;
use crate::error::{Error, Result};
use regex::Regex;

/// How a single rule selects kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSelector<'a> {
    Literal(&'a str),
    Pattern(&'a str),
}

impl<'a> KernelSelector<'a> {
    /// Extract the selector of a rule; exactly one of literal/regexp must be set
    pub fn of(mapping: &'a KernelMapping) -> Result<Self> {
        match (mapping.literal.as_deref(), mapping.regexp.as_deref()) {
            (Some(literal), None) => Ok(KernelSelector::Literal(literal)),
            (None, Some(pattern)) => Ok(KernelSelector::Pattern(pattern)),
            (Some(_), Some(_)) => Err(Error::InvalidKernelMapping {
                reason: "literal and regexp are mutually exclusive".into(),
            }),
            (None, None) => Err(Error::InvalidKernelMapping {
                reason: "one of literal or regexp must be set".into(),
            }),
        }
    }

    pub fn matches(&self, kernel: &KernelVersion) -> Result<bool> {
        match self {
            KernelSelector::Literal(literal) => Ok(*literal == kernel.as_str()),
            KernelSelector::Pattern(pattern) => {
                let re = Regex::new(pattern).map_err(|source| Error::InvalidKernelPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
                Ok(re.is_match(kernel.as_str()))
            }
        }
    }
}

/// Return the first rule matching `kernel`, or `None` when no rule applies.
///
/// A malformed rule met before a match fails the lookup for this kernel
/// only, since later rules cannot be trusted to be the first match.
pub fn find_mapping<'a>(
    kernel: &KernelVersion,
    rules: &'a [KernelMapping],
) -> Result<Option<&'a KernelMapping>> {
    for rule in rules {
        if KernelSelector::of(rule)?.matches(kernel)? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn literal(v: &str, image: &str) -> KernelMapping {
        KernelMapping {
            literal: Some(v.into()),
            container_image: Some(image.into()),
            ..Default::default()
        }
    }

    fn pattern(p: &str, image: &str) -> KernelMapping {
        KernelMapping {
            regexp: Some(p.into()),
            container_image: Some(image.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            pattern(r"^5\.14", "first"),
            literal("5.14.0-1", "second"),
        ];
        let kernel = KernelVersion::normalize("5.14.0-1");
        let found = find_mapping(&kernel, &rules).unwrap().unwrap();
        assert_eq!(found.container_image.as_deref(), Some("first"));
    }

    #[test]
    fn test_literal_after_suffix_strip() {
        let rules = vec![literal("5.14.0-1", "img")];
        let kernel = KernelVersion::normalize("5.14.0-1+");
        assert!(find_mapping(&kernel, &rules).unwrap().is_some());
    }

    #[test]
    fn test_literal_is_exact() {
        let rules = vec![literal("5.14.0", "img")];
        let kernel = KernelVersion::normalize("5.14.0-1");
        assert!(find_mapping(&kernel, &rules).unwrap().is_none());
    }

    #[test]
    fn test_pattern_is_unanchored_search() {
        let rules = vec![pattern(r"el9", "img")];
        let kernel = KernelVersion::normalize("5.14.0-284.el9.x86_64");
        assert!(find_mapping(&kernel, &rules).unwrap().is_some());
    }

    #[test]
    fn test_no_match() {
        let rules = vec![literal("5.14.0-1", "a"), pattern(r"^4\.", "b")];
        let kernel = KernelVersion::normalize("6.0.0-rc1");
        assert!(find_mapping(&kernel, &rules).unwrap().is_none());
        assert!(find_mapping(&kernel, &[]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_rules() {
        let kernel = KernelVersion::normalize("5.14.0-1");

        let both = KernelMapping {
            literal: Some("5.14.0-1".into()),
            regexp: Some(".*".into()),
            ..Default::default()
        };
        assert_matches!(
            find_mapping(&kernel, &[both]),
            Err(Error::InvalidKernelMapping { .. })
        );

        let neither = KernelMapping::default();
        assert_matches!(
            find_mapping(&kernel, &[neither]),
            Err(Error::InvalidKernelMapping { .. })
        );

        assert_matches!(
            find_mapping(&kernel, &[pattern("(", "img")]),
            Err(Error::InvalidKernelPattern { .. })
        );
    }

    #[test]
    fn test_invalid_rule_after_match_is_not_evaluated() {
        let kernel = KernelVersion::normalize("5.14.0-1");
        let rules = vec![literal("5.14.0-1", "img"), pattern("(", "broken")];
        assert!(find_mapping(&kernel, &rules).unwrap().is_some());
    }
}
