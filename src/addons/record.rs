//! Installation records.
//!
//! One plain-text sidecar lives in every main folder the engine installed or
//! adopted. It is the only state the engine persists.

use std::fmt;

use super::types::AddonId;

/// Sidecar file name inside a main folder.
pub const RECORD_FILE_NAME: &str = "AddonKeeper.txt";

/// Maximum sidecar lines read.
const MAX_RECORD_LINES: usize = 64;

/// Kind of upstream fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintKind {
    /// A release tag.
    Release,
    /// A default-branch commit id.
    Commit,
}

impl FingerprintKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Commit => "commit",
        }
    }
}

/// Upstream identity of an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFingerprint {
    pub kind: FingerprintKind,
    /// Tag name or short commit id.
    pub value: String,
}

impl SourceFingerprint {
    /// Creates a release fingerprint.
    #[must_use]
    pub fn release(tag: impl Into<String>) -> Self {
        Self {
            kind: FingerprintKind::Release,
            value: tag.into(),
        }
    }

    /// Creates a commit fingerprint.
    #[must_use]
    pub fn commit(sha: impl Into<String>) -> Self {
        Self {
            kind: FingerprintKind::Commit,
            value: sha.into(),
        }
    }

    /// Parses `release:<tag>` or `commit:<sha>`; a bare value is a commit.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let parsed = match input.split_once(':') {
            Some(("release", tag)) => Self::release(tag.trim()),
            Some(("commit", sha)) => Self::commit(sha.trim()),
            _ => Self::commit(input),
        };

        if parsed.value.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }

    /// Returns true if both name the same upstream state.
    ///
    /// Commit ids match on the shorter prefix.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            FingerprintKind::Release => self.value == other.value,
            FingerprintKind::Commit => {
                let n = self.value.len().min(other.value.len());
                match (self.value.get(..n), other.value.get(..n)) {
                    (Some(a), Some(b)) => n > 0 && a.eq_ignore_ascii_case(b),
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.value)
    }
}

/// Contents of a sidecar.
///
/// Every field is optional on read so a damaged record still yields
/// whatever it holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRecord {
    pub id: Option<AddonId>,
    pub folders: Vec<String>,
    pub filename: String,
    pub backend_version: Option<String>,
    pub fingerprint: Option<SourceFingerprint>,
}

impl InstallRecord {
    /// Parses sidecar text.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut record = Self::default();

        for line in content.lines().take(MAX_RECORD_LINES) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "ID" => record.id = value.parse().ok(),
                "Folders" => {
                    record.folders = value
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect();
                }
                "Filename" => record.filename = value.to_string(),
                "BackendVersion" => {
                    record.backend_version = (!value.is_empty()).then(|| value.to_string());
                }
                "GitFingerprint" => record.fingerprint = SourceFingerprint::parse(value),
                _ => {}
            }
        }

        record
    }

    /// Renders the sidecar text. Output is deterministic for equal records.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(id) = self.id {
            out.push_str(&format!("ID: {}\n", id));
        }
        out.push_str(&format!("Folders: {}\n", self.folders.join(",")));
        out.push_str(&format!("Filename: {}\n", self.filename));
        if let Some(ref version) = self.backend_version {
            out.push_str(&format!("BackendVersion: {}\n", version));
        }
        if let Some(ref fingerprint) = self.fingerprint {
            out.push_str(&format!("GitFingerprint: {}\n", fingerprint));
        }
        out
    }
}

/// Derives the package filename from a download URL.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_record() {
        let text = "ID: 42\nFolders: Foo, Bar\nFilename: foo-1.2.zip\nBackendVersion: 1.2.0\nGitFingerprint: release:v1.2.0\n";
        let record = InstallRecord::parse(text);
        assert_eq!(record.id, Some(42));
        assert_eq!(record.folders, vec!["Foo", "Bar"]);
        assert_eq!(record.filename, "foo-1.2.zip");
        assert_eq!(record.backend_version.as_deref(), Some("1.2.0"));
        assert_eq!(record.fingerprint, Some(SourceFingerprint::release("v1.2.0")));
    }

    #[test]
    fn test_parse_tolerates_malformed_fields() {
        let record = InstallRecord::parse("ID: not-a-number\nFilename: x.zip\nnonsense line\n");
        assert_eq!(record.id, None);
        assert_eq!(record.filename, "x.zip");
        assert!(record.folders.is_empty());
        assert!(record.fingerprint.is_none());
    }

    #[test]
    fn test_render_parses_back() {
        let record = InstallRecord {
            id: Some(1),
            folders: vec!["Foo".into(), "Bar".into()],
            filename: "foo.zip".into(),
            backend_version: Some("1.2.0".into()),
            fingerprint: Some(SourceFingerprint::commit("abc1234")),
        };
        assert_eq!(InstallRecord::parse(&record.render()), record);
    }

    #[test]
    fn test_fingerprint_commit_prefix_match() {
        let short = SourceFingerprint::commit("abc1234");
        let long = SourceFingerprint::commit("abc1234def5678");
        assert!(short.matches(&long));
        assert!(!short.matches(&SourceFingerprint::release("abc1234")));
        assert!(!short.matches(&SourceFingerprint::commit("fff0000")));
    }

    #[test]
    fn test_fingerprint_bare_value_is_commit() {
        let fp = SourceFingerprint::parse("deadbee").unwrap();
        assert_eq!(fp.kind, FingerprintKind::Commit);
        assert!(SourceFingerprint::parse("release:").is_none());
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://cdn.example.invalid/files/foo-1.2.zip?dl=1"),
            "foo-1.2.zip"
        );
        assert_eq!(filename_from_url("https://example.invalid/a/b/"), "b");
        assert_eq!(filename_from_url(""), "");
    }
}
