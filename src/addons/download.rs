//! Package downloads.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::AddonError;

/// Read buffer size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Highest percentage reported before a download without a known length
/// completes.
pub const SYNTHETIC_CAP: u8 = 95;

/// Percentage added per chunk when the length is unknown.
const SYNTHETIC_STEP: u8 = 5;

/// Fetches package archives.
pub trait Downloader: Send + Sync {
    /// Downloads `url` to `dest`, reporting percentages through `progress`.
    ///
    /// Reports are non-decreasing and end at 100 on success.
    fn download(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u8)) -> Result<(), AddonError>;
}

/// Converts byte counts to percentages.
///
/// Without a total it ramps in fixed steps up to [`SYNTHETIC_CAP`].
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: Option<u64>,
    received: u64,
    last: u8,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            received: 0,
            last: 0,
        }
    }

    /// Records `bytes` more and returns the new percentage if it changed.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.received += bytes;
        let next = match self.total {
            Some(total) => ((self.received.min(total) * 99) / total) as u8,
            None => self.last.saturating_add(SYNTHETIC_STEP).min(SYNTHETIC_CAP),
        };

        if next > self.last {
            self.last = next;
            Some(next)
        } else {
            None
        }
    }

    /// Final report.
    pub fn finish(&mut self) -> u8 {
        self.last = 100;
        100
    }
}

/// Downloader over blocking HTTP.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloader {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent("addonkeeper")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self { client }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u8)) -> Result<(), AddonError> {
        info!("[INSTALL] Downloading {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| AddonError::Network(format!("Download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AddonError::Network(format!(
                "Download failed: {}",
                response.status()
            )));
        }

        let mut tracker = ProgressTracker::new(response.content_length());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
        }
        let mut file = File::create(dest).map_err(|e| AddonError::fs(dest, e))?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| AddonError::Network(format!("Failed to read response: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).map_err(|e| AddonError::fs(dest, e))?;
            if let Some(pct) = tracker.advance(n as u64) {
                progress(pct);
            }
        }

        file.flush().map_err(|e| AddonError::fs(dest, e))?;
        progress(tracker.finish());
        debug!("[INSTALL] Saved {} bytes to {}", tracker.received, dest.display());
        Ok(())
    }
}

/// Tries each URL in order until one succeeds.
///
/// A partial file left by a failed attempt is removed before the next.
pub fn download_first(
    downloader: &dyn Downloader,
    urls: &[String],
    dest: &Path,
    progress: &mut dyn FnMut(u8),
) -> Result<String, AddonError> {
    let mut last_err = AddonError::Network("No download source".to_string());

    for url in urls {
        match downloader.download(url, dest, progress) {
            Ok(()) => return Ok(url.clone()),
            Err(AddonError::PathViolation(p)) => return Err(AddonError::PathViolation(p)),
            Err(e) => {
                warn!("[INSTALL] Download from {} failed: {}", url, e);
                let _ = fs::remove_file(dest);
                last_err = e;
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_length_progress() {
        let mut t = ProgressTracker::new(Some(200));
        assert_eq!(t.advance(100), Some(49));
        assert_eq!(t.advance(100), Some(99));
        assert_eq!(t.advance(0), None);
        assert_eq!(t.finish(), 100);
    }

    #[test]
    fn test_synthetic_ramp_capped() {
        let mut t = ProgressTracker::new(None);
        let mut seen = Vec::new();
        for _ in 0..40 {
            if let Some(p) = t.advance(1) {
                seen.push(p);
            }
        }
        assert_eq!(seen.first(), Some(&SYNTHETIC_STEP));
        assert_eq!(seen.last(), Some(&SYNTHETIC_CAP));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    struct Failing;

    impl Downloader for Failing {
        fn download(&self, url: &str, dest: &Path, _: &mut dyn FnMut(u8)) -> Result<(), AddonError> {
            if url.contains("good") {
                fs::write(dest, b"ok").map_err(|e| AddonError::fs(dest, e))
            } else {
                Err(AddonError::Network("boom".into()))
            }
        }
    }

    #[test]
    fn test_download_first_falls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("pkg.zip");
        let urls = vec!["https://bad".to_string(), "https://good".to_string()];
        let used = download_first(&Failing, &urls, &dest, &mut |_| {}).unwrap();
        assert_eq!(used, "https://good");
        assert!(dest.exists());
    }
}
