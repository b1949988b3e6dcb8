//! Version strings and on-disk version descriptors.
//!
//! Versions compare on three numeric components only. Pre-release and
//! build suffixes are ignored.

use std::cmp::Ordering;
use std::fmt;

use super::types::DEFAULT_LOCAL_VERSION;

/// Manifest extensions checked inside a main folder, in priority order.
pub const MANIFEST_EXTENSIONS: &[&str] = &["txt", "toc"];

/// Maximum manifest lines inspected for descriptor keys.
const MAX_DESCRIPTOR_LINES: usize = 200;

/// A major.minor.patch version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddonVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl AddonVersion {
    /// Parses a version string leniently.
    ///
    /// A leading `v` is dropped, missing components are zero and each
    /// component keeps only its leading digits (`"2.1b"` is `2.1.0`).
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim().trim_start_matches(['v', 'V']);
        let mut parts = trimmed.split('.').map(leading_number);

        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for AddonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn leading_number(component: &str) -> u64 {
    let digits: String = component
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

/// Compares two version strings on their numeric components.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    AddonVersion::parse(a).cmp(&AddonVersion::parse(b))
}

/// Returns true if `candidate` is strictly newer than `current`.
#[must_use]
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Returns the greater of two version strings, preferring `a` on a tie.
#[must_use]
pub fn max_version<'a>(a: &'a str, b: &'a str) -> &'a str {
    if compare_versions(b, a) == Ordering::Greater {
        b
    } else {
        a
    }
}

/// Keys read from an add-on manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// `Title:` value with client color codes removed.
    pub title: Option<String>,
    /// `Version:` value.
    pub version: Option<String>,
}

impl Descriptor {
    /// Parses manifest text.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut descriptor = Self::default();

        for line in content.lines().take(MAX_DESCRIPTOR_LINES) {
            let Some((key, value)) = split_descriptor_line(line) else {
                continue;
            };

            if key.eq_ignore_ascii_case("Version") && descriptor.version.is_none() {
                if !value.is_empty() {
                    descriptor.version = Some(value.to_string());
                }
            } else if key.eq_ignore_ascii_case("Title") && descriptor.title.is_none() {
                let title = strip_color_codes(value);
                if !title.is_empty() {
                    descriptor.title = Some(title);
                }
            }
        }

        descriptor
    }

    /// Returns the declared version or the default.
    #[must_use]
    pub fn version_or_default(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_VERSION.to_string())
    }
}

/// Splits `## Key: value` into key and value.
fn split_descriptor_line(line: &str) -> Option<(&str, &str)> {
    let stripped = line.trim().trim_start_matches('#').trim_start();
    let (key, value) = stripped.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

/// Rewrites the `Version:` line of a manifest.
///
/// Inserts a `## Version:` line after the title (or at the top) when the
/// manifest has none.
#[must_use]
pub fn bump_descriptor_version(content: &str, version: &str) -> String {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    let version_index = lines.iter().position(|line| {
        split_descriptor_line(line).is_some_and(|(key, _)| key.eq_ignore_ascii_case("Version"))
    });

    match version_index {
        Some(i) => {
            let prefix_len = lines[i].len() - lines[i].trim_start_matches(['#', ' ']).len();
            let prefix = lines[i][..prefix_len].to_string();
            lines[i] = format!("{}Version: {}", prefix, version);
        }
        None => {
            let title_index = lines.iter().position(|line| {
                split_descriptor_line(line)
                    .is_some_and(|(key, _)| key.eq_ignore_ascii_case("Title"))
            });
            let insert_at = title_index.map_or(0, |i| i + 1);
            lines.insert(insert_at, format!("## Version: {}", version));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Removes `|cAARRGGBB` and `|r` color escapes from a title.
///
/// A `|c` not followed by exactly eight hex digits is kept as text.
#[must_use]
pub fn strip_color_codes(title: &str) -> String {
    let chars: Vec<char> = title.chars().collect();
    let mut out = String::with_capacity(title.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '|' {
            match chars.get(i + 1) {
                Some('c' | 'C') => {
                    let code = chars.get(i + 2..i + 10);
                    if code.is_some_and(|d| d.iter().all(char::is_ascii_hexdigit)) {
                        i += 10;
                        continue;
                    }
                }
                Some('r' | 'R') => {
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out.trim().to_string()
}

/// Case-insensitive title comparison after color-code stripping.
#[must_use]
pub fn titles_match(a: &str, b: &str) -> bool {
    let a = strip_color_codes(a);
    let b = strip_color_codes(b);
    !a.is_empty() && a.eq_ignore_ascii_case(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            AddonVersion::parse("1.2.3"),
            AddonVersion { major: 1, minor: 2, patch: 3 }
        );
        assert_eq!(AddonVersion::parse("v2.1").to_string(), "2.1.0");
        assert_eq!(AddonVersion::parse("3").to_string(), "3.0.0");
        assert_eq!(AddonVersion::parse("1.4b").to_string(), "1.4.0");
        assert_eq!(AddonVersion::parse("garbage").to_string(), "0.0.0");
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("1.2.0", "1.0.0"));
        assert!(is_newer("1.10", "1.9.9"));
        assert!(!is_newer("1.2", "1.2.0"));
        assert!(!is_newer("1.0.0", "1.2.0"));
        assert!(!is_newer("1.2.0-beta", "1.2.0"));
    }

    #[test]
    fn test_max_version() {
        assert_eq!(max_version("1.0.0", "1.2.0"), "1.2.0");
        assert_eq!(max_version("2.0", "1.9"), "2.0");
        assert_eq!(max_version("1.0", "1.0.0"), "1.0");
    }

    #[test]
    fn test_descriptor_parse() {
        let text = "## Title: |cFF00FF00Foo|r Bars\n## APIVersion: 101041\n## Version: 1.4.2\nFoo.lua\n";
        let d = Descriptor::parse(text);
        assert_eq!(d.title.as_deref(), Some("Foo Bars"));
        assert_eq!(d.version.as_deref(), Some("1.4.2"));
    }

    #[test]
    fn test_descriptor_default_version() {
        let d = Descriptor::parse("## Title: Foo\n");
        assert_eq!(d.version_or_default(), DEFAULT_LOCAL_VERSION);
    }

    #[test]
    fn test_bump_existing_version() {
        let text = "## Title: Foo\n## Version: 1.0.0\nFoo.lua";
        let out = bump_descriptor_version(text, "1.2.0");
        assert_eq!(out, "## Title: Foo\n## Version: 1.2.0\nFoo.lua\n");
    }

    #[test]
    fn test_bump_inserts_after_title() {
        let out = bump_descriptor_version("## Title: Foo\nFoo.lua\n", "2.0");
        assert_eq!(out, "## Title: Foo\n## Version: 2.0\nFoo.lua\n");
    }

    #[test]
    fn test_strip_short_color_code_keeps_text() {
        assert_eq!(strip_color_codes("|cffBad|r"), "|cffBad");
        assert_eq!(strip_color_codes("|cAABBCCDDAce|r"), "Ace");
        assert_eq!(strip_color_codes("a|b"), "a|b");
    }

    #[test]
    fn test_titles_match() {
        assert!(titles_match("|cffffffffFoo|r", "foo"));
        assert!(titles_match("|cFF00FF00Deadly|r Boss Mods", "Deadly Boss Mods"));
        assert!(!titles_match("|cffffffFoo|r", "foo"));
        assert!(!titles_match("", ""));
        assert!(!titles_match("Foo", "Bar"));
    }
}
