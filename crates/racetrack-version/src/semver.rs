//! Semantic version parsing and ordering.
//!
//! Versions match `MAJOR.MINOR.PATCH[LABEL]`, e.g. `1.2.3`,
//! `10.0.1-alpha`, `0.0.0-dev`. Ordering compares the numeric triple
//! first; at an equal triple an unlabeled version is greater than any
//! labeled one, and labels compare ASCII-lexicographically.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::VersionError;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)(?P<label>.*)$")
        .expect("version regex")
});

static X_PATTERN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+|x)(\.(\d+|x))*$").expect("x-pattern regex"));

/// A parsed semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release label including its separator, e.g. `-rc1`. Empty for stable versions.
    pub label: String,
}

impl SemanticVersion {
    /// Whether this is a stable version (no pre-release label).
    pub fn is_stable(&self) -> bool {
        self.label.is_empty()
    }

    /// Find the object with the highest stable version among the given ones.
    pub fn find_latest_stable<'a, T>(
        objects: impl IntoIterator<Item = &'a T>,
        key: impl Fn(&T) -> &str,
    ) -> Option<&'a T> {
        objects
            .into_iter()
            .filter_map(|obj| {
                let version: SemanticVersion = key(obj).parse().ok()?;
                version.is_stable().then_some((version, obj))
            })
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, obj)| obj)
    }

    /// Find the object with the highest stable version matching the pattern.
    pub fn find_latest_matching<'a, T>(
        pattern: &SemanticVersionPattern,
        objects: impl IntoIterator<Item = &'a T>,
        key: impl Fn(&T) -> &str,
    ) -> Option<&'a T> {
        objects
            .into_iter()
            .filter_map(|obj| {
                let version: SemanticVersion = key(obj).parse().ok()?;
                (version.is_stable() && pattern.matches(&version)).then_some((version, obj))
            })
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, obj)| obj)
    }
}

impl FromStr for SemanticVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = VERSION_RE
            .captures(s)
            .ok_or_else(|| VersionError::InvalidVersion(s.to_string()))?;
        // The regex guarantees the numeric groups parse.
        Ok(Self {
            major: captures["major"].parse().unwrap_or(0),
            minor: captures["minor"].parse().unwrap_or(0),
            patch: captures["patch"].parse().unwrap_or(0),
            label: captures["label"].to_string(),
        })
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.label)
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| compare_labels(&self.label, &other.label))
    }
}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A pre-release version has lower precedence than a normal version:
/// `1.0.0-alpha < 1.0.0`. Among labeled versions the label strings
/// compare lexicographically.
fn compare_labels(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// A version pattern with `x` wildcards, e.g. `1.2.x`, `2.x`.
#[derive(Debug, Clone)]
pub struct SemanticVersionPattern {
    regex: Regex,
}

impl SemanticVersionPattern {
    /// Parse an `x`-wildcard pattern. The bare pattern `x` matches everything.
    pub fn from_x_pattern(pattern: &str) -> Result<Self, VersionError> {
        if !Self::is_x_pattern(pattern) {
            return Err(VersionError::InvalidPattern(pattern.to_string()));
        }
        let regex_str = format!("^{}$", pattern.replace('.', r"\.").replace('x', ".+"));
        let regex = Regex::new(&regex_str)
            .map_err(|_| VersionError::InvalidPattern(pattern.to_string()))?;
        Ok(Self { regex })
    }

    /// Check whether the string is a valid pattern containing `x` wildcards.
    pub fn is_x_pattern(pattern: &str) -> bool {
        X_PATTERN_RE.is_match(pattern) && pattern.contains('x')
    }

    /// Whether the given version matches this pattern.
    pub fn matches(&self, version: &SemanticVersion) -> bool {
        self.regex.is_match(&version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SemanticVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parses_plain_and_labeled_versions() {
        let version = v("1.2.3");
        assert_eq!((version.major, version.minor, version.patch), (1, 2, 3));
        assert!(version.is_stable());

        let version = v("10.0.1-alpha");
        assert_eq!(version.major, 10);
        assert_eq!(version.label, "-alpha");
        assert!(!version.is_stable());
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!("1.2".parse::<SemanticVersion>().is_err());
        assert!("abc".parse::<SemanticVersion>().is_err());
        assert!("".parse::<SemanticVersion>().is_err());
    }

    #[test]
    fn numeric_ordering() {
        assert!(v("2.0.0") > v("1.9.9"));
        assert!(v("1.10.0") > v("1.9.0"));
        assert!(v("1.0.10") > v("1.0.9"));
        assert_eq!(v("1.0.0"), v("1.0.0"));
    }

    #[test]
    fn unlabeled_beats_labeled_at_equal_triple() {
        assert!(v("1.0.0") > v("1.0.0-rc1"));
        assert!(v("1.0.0-alpha") < v("1.0.0"));
    }

    #[test]
    fn labels_compare_lexicographically() {
        assert!(v("1.0.0-alpha") < v("1.0.0-beta"));
        assert!(v("1.0.0-rc2") > v("1.0.0-rc1"));
    }

    #[test]
    fn display_round_trips() {
        for s in ["1.2.3", "0.0.0-dev", "10.0.1-alpha"] {
            assert_eq!(v(s).to_string(), s);
        }
    }

    #[test]
    fn find_latest_stable_skips_prereleases() {
        let versions = ["1.0.0", "1.2.0", "2.0.0-rc1"];
        let latest = SemanticVersion::find_latest_stable(versions.iter(), |s| s).unwrap();
        assert_eq!(*latest, "1.2.0");
    }

    #[test]
    fn find_latest_stable_with_no_stable_versions() {
        let versions = ["1.0.0-rc1", "2.0.0-dev"];
        assert!(SemanticVersion::find_latest_stable(versions.iter(), |s| s).is_none());
    }

    #[test]
    fn x_pattern_validation() {
        assert!(SemanticVersionPattern::is_x_pattern("1.2.x"));
        assert!(SemanticVersionPattern::is_x_pattern("2.x"));
        assert!(SemanticVersionPattern::is_x_pattern("x"));
        assert!(!SemanticVersionPattern::is_x_pattern("1.2.3"));
        assert!(!SemanticVersionPattern::is_x_pattern("latest"));
        assert!(!SemanticVersionPattern::is_x_pattern("1.2.*"));
    }

    #[test]
    fn x_pattern_matching() {
        let pattern = SemanticVersionPattern::from_x_pattern("1.x").unwrap();
        assert!(pattern.matches(&v("1.0.1")));
        assert!(pattern.matches(&v("1.2.0")));
        assert!(!pattern.matches(&v("2.0.0")));

        let pattern = SemanticVersionPattern::from_x_pattern("1.2.x").unwrap();
        assert!(pattern.matches(&v("1.2.9")));
        assert!(!pattern.matches(&v("1.3.0")));
    }

    #[test]
    fn find_latest_matching_pattern() {
        let versions = ["1.0.1", "1.2.0", "2.0.0"];

        let pattern = SemanticVersionPattern::from_x_pattern("1.x").unwrap();
        let latest =
            SemanticVersion::find_latest_matching(&pattern, versions.iter(), |s| s).unwrap();
        assert_eq!(*latest, "1.2.0");

        let pattern = SemanticVersionPattern::from_x_pattern("x").unwrap();
        let latest =
            SemanticVersion::find_latest_matching(&pattern, versions.iter(), |s| s).unwrap();
        assert_eq!(*latest, "2.0.0");
    }
}
