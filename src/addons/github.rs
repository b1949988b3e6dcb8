//! Source-control fingerprinting.
//!
//! [`SourceControl`] is the capability the freshness resolver and the
//! installer use to learn the newest upstream state of a repository.
//! [`GitHubClient`] implements it against the GitHub REST API.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::record::SourceFingerprint;
use super::types::AddonError;

/// Cache expiration time (5 minutes).
const CACHE_EXPIRATION_SECS: u64 = 300;

/// Length of stored commit ids.
const SHORT_SHA_LEN: usize = 7;

/// Hosts recognized as GitHub.
const GITHUB_HOSTS: &[&str] = &["github.com", "www.github.com"];

/// An `owner/repo` pair on a source-control host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    /// Parses a repository web URL such as `https://github.com/o/r`.
    ///
    /// Returns `None` for other hosts or URLs without owner and repo.
    #[must_use]
    pub fn parse(link: &str) -> Option<Self> {
        let url = Url::parse(link.trim()).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        if !GITHUB_HOSTS.contains(&host.as_str()) {
            return None;
        }

        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let owner = segments.next()?.to_string();
        let repo = segments.next()?.trim_end_matches(".git").to_string();
        if repo.is_empty() {
            return None;
        }

        Some(Self { owner, repo })
    }

    /// Archive of the default branch.
    #[must_use]
    pub fn default_branch_archive_url(&self) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/zipball",
            self.owner, self.repo
        )
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Latest published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub tag: String,
    pub published_at: DateTime<Utc>,
}

/// Latest default-branch commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub committed_at: DateTime<Utc>,
}

/// Upstream state lookups.
pub trait SourceControl: Send + Sync {
    /// Latest release, or `None` if the repository has none.
    fn latest_release(&self, repo: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError>;

    /// Latest commit on the default branch.
    fn latest_commit(&self, repo: &RepoRef) -> Result<Option<CommitInfo>, AddonError>;
}

/// Picks whichever of release and commit is newer.
///
/// A tie goes to the release.
#[must_use]
pub fn newest_fingerprint(
    release: Option<ReleaseInfo>,
    commit: Option<CommitInfo>,
) -> Option<SourceFingerprint> {
    match (release, commit) {
        (Some(r), Some(c)) if c.committed_at > r.published_at => {
            Some(SourceFingerprint::commit(short_sha(&c.sha)))
        }
        (Some(r), _) => Some(SourceFingerprint::release(r.tag)),
        (None, Some(c)) => Some(SourceFingerprint::commit(short_sha(&c.sha))),
        (None, None) => None,
    }
}

/// Fetches release and commit and returns the newer fingerprint.
pub fn latest_fingerprint(
    source: &dyn SourceControl,
    repo: &RepoRef,
) -> Result<Option<SourceFingerprint>, AddonError> {
    let release = source.latest_release(repo)?;
    let commit = source.latest_commit(repo)?;
    let fingerprint = newest_fingerprint(release, commit);
    debug!("[GITHUB] {} newest fingerprint: {:?}", repo, fingerprint);
    Ok(fingerprint)
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(SHORT_SHA_LEN).collect()
}

/// GitHub API response for the latest release.
#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    published_at: Option<String>,
    created_at: Option<String>,
}

/// GitHub API response for a commit listing entry.
#[derive(Debug, Deserialize)]
struct GitHubCommit {
    sha: String,
    commit: GitHubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitDetail {
    committer: Option<GitHubSignature>,
    author: Option<GitHubSignature>,
}

#[derive(Debug, Deserialize)]
struct GitHubSignature {
    date: String,
}

/// Parses an RFC 3339 API timestamp.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!("[GITHUB] Invalid timestamp '{}': {}", value, e);
            None
        }
    }
}

/// Cached fingerprint lookup with expiration.
struct CachedLookup {
    release: Option<ReleaseInfo>,
    commit: Option<CommitInfo>,
    cached_at: Instant,
}

/// GitHub REST client.
pub struct GitHubClient {
    /// HTTP client.
    client: reqwest::blocking::Client,
    /// Optional personal access token.
    token: Option<String>,
    /// API base URL.
    api_base: String,
    /// Lookups by repository.
    cache: Arc<RwLock<HashMap<RepoRef, CachedLookup>>>,
}

impl GitHubClient {
    /// Creates a client.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent("addonkeeper")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            token: token.filter(|t| !t.is_empty()),
            api_base: String::from("https://api.github.com"),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Clears cached lookups.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Returns both lookups for a repository, from cache when fresh.
    fn lookup(&self, repo: &RepoRef) -> Result<(Option<ReleaseInfo>, Option<CommitInfo>), AddonError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.get(repo) {
                if cached.cached_at.elapsed() < Duration::from_secs(CACHE_EXPIRATION_SECS) {
                    debug!("[GITHUB] Cache hit for {}", repo);
                    return Ok((cached.release.clone(), cached.commit.clone()));
                }
            }
        }

        let start = Instant::now();
        let release = self.fetch_release(repo)?;
        let commit = self.fetch_commit(repo)?;
        info!("[GITHUB] Looked up {} in {:?}", repo, start.elapsed());

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                repo.clone(),
                CachedLookup {
                    release: release.clone(),
                    commit: commit.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        Ok((release, commit))
    }

    fn fetch_release(&self, repo: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, repo.owner, repo.repo
        );
        let Some(release) = self.get_json::<GitHubRelease>(&url)? else {
            return Ok(None);
        };

        let published_at = release
            .published_at
            .as_deref()
            .or(release.created_at.as_deref())
            .and_then(parse_timestamp);
        let Some(published_at) = published_at else {
            warn!("[GITHUB] Release {} of {} has no date", release.tag_name, repo);
            return Ok(None);
        };

        Ok(Some(ReleaseInfo {
            tag: release.tag_name,
            published_at,
        }))
    }

    fn fetch_commit(&self, repo: &RepoRef) -> Result<Option<CommitInfo>, AddonError> {
        let url = format!(
            "{}/repos/{}/{}/commits?per_page=1",
            self.api_base, repo.owner, repo.repo
        );
        let commits = self.get_json::<Vec<GitHubCommit>>(&url)?.unwrap_or_default();

        Ok(commits.into_iter().next().and_then(|c| {
            let date = c
                .commit
                .committer
                .or(c.commit.author)
                .and_then(|s| parse_timestamp(&s.date))?;
            Some(CommitInfo {
                sha: c.sha,
                committed_at: date,
            })
        }))
    }

    /// GETs a JSON document; `Ok(None)` on 404.
    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>, AddonError> {
        debug!("[GITHUB] GET {}", url);

        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            warn!("[GITHUB] HTTP request failed: {}", e);
            AddonError::Network(e.to_string())
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == reqwest::StatusCode::FORBIDDEN {
            if let Some(remaining) = response.headers().get("x-ratelimit-remaining") {
                if remaining.to_str().unwrap_or("1") == "0" {
                    warn!("[GITHUB] Rate limit exceeded");
                    return Err(AddonError::RateLimited);
                }
            }
        }

        if !status.is_success() {
            warn!("[GITHUB] API error: {}", status);
            return Err(AddonError::Network(format!("GitHub API error: {}", status)));
        }

        response
            .json::<T>()
            .map(Some)
            .map_err(|e| AddonError::Network(format!("Failed to parse response: {}", e)))
    }
}

impl SourceControl for GitHubClient {
    fn latest_release(&self, repo: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError> {
        Ok(self.lookup(repo)?.0)
    }

    fn latest_commit(&self, repo: &RepoRef) -> Result<Option<CommitInfo>, AddonError> {
        Ok(self.lookup(repo)?.1)
    }
}
