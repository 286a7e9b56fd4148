//! Tarball download with retry and integrity verification.
//!
//! A tarball is only ever used after its SHA-256 has been checked against
//! the configured digest or, when none is configured, against the digest
//! recorded the first time it was downloaded.
//!
//! ```rust,ignore
//! use ovs_installer::fetch::{CurlTransport, Fetcher};
//!
//! let fetcher = Fetcher::new(&CurlTransport, 3, Duration::from_secs(2));
//! let outcome = fetcher.fetch(&layout.download_url, &layout.tarball, config.sha256.as_deref())?;
//! ```

pub mod archive;
pub mod checksum;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::process::Cmd;
use checksum::{read_sidecar, sha256_file, write_sidecar};

/// Moves bytes from a URL to a local file.
pub trait Transport {
    /// Download `url` to `dest`, overwriting it.
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Downloads with the host `curl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurlTransport;

impl Transport for CurlTransport {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        Cmd::new("curl")
            .args(["-fsSL", "-o"])
            .arg_path(dest)
            .arg(url)
            .error_msg(&format!("download failed: {url}"))
            .run()?;
        Ok(())
    }
}

/// Where the accepted digest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestSource {
    /// `sha256` from the configuration
    Configured,
    /// Sidecar recorded by an earlier download
    Recorded,
    /// No digest was known; this download's digest was just recorded
    FirstUse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// A verified tarball was already on disk.
    Cached,
    Downloaded { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub source: FetchSource,
    pub digest: DigestSource,
}

pub struct Fetcher<'a> {
    transport: &'a dyn Transport,
    retries: u32,
    retry_delay: Duration,
}

impl<'a> Fetcher<'a> {
    /// `retries` is the number of extra attempts after the first one.
    pub fn new(transport: &'a dyn Transport, retries: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            retries,
            retry_delay,
        }
    }

    /// Ensure a verified copy of `url` exists at `dest`.
    pub fn fetch(&self, url: &str, dest: &Path, configured: Option<&str>) -> Result<FetchOutcome> {
        let (expected, digest_source) = match configured {
            Some(sha) => (Some(sha.to_ascii_lowercase()), DigestSource::Configured),
            None => match read_sidecar(dest)? {
                Some(sha) => (Some(sha), DigestSource::Recorded),
                None => (None, DigestSource::FirstUse),
            },
        };

        if let Some(cached) = self.try_cached(dest, expected.as_deref(), digest_source)? {
            return Ok(cached);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating download directory '{}'", parent.display()))?;
        }

        let part = partial_path(dest);
        let attempts = self.retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry_delay.saturating_mul(attempt - 1);
                log::warn!(
                    "retrying download in {}s (attempt {}/{})",
                    delay.as_secs(),
                    attempt,
                    attempts
                );
                thread::sleep(delay);
            }

            match self.attempt(url, &part, expected.as_deref()) {
                Ok((sha256, size_bytes)) => {
                    fs::rename(&part, dest).with_context(|| {
                        format!("moving '{}' -> '{}'", part.display(), dest.display())
                    })?;
                    if digest_source == DigestSource::FirstUse {
                        log::warn!(
                            "no sha256 configured for {}; recorded {} for future runs",
                            url,
                            sha256
                        );
                        write_sidecar(dest, &sha256)?;
                    }
                    log::info!("downloaded {} ({} bytes, sha256 {})", url, size_bytes, sha256);
                    return Ok(FetchOutcome {
                        path: dest.to_path_buf(),
                        sha256,
                        size_bytes,
                        source: FetchSource::Downloaded { attempts: attempt },
                        digest: digest_source,
                    });
                }
                Err(e) => {
                    log::warn!("download attempt {}/{} failed: {:#}", attempt, attempts, e);
                    let _ = fs::remove_file(&part);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow::anyhow!("no download attempt was made"));
        Err(err.context(format!(
            "fetching {} failed after {} attempt(s)",
            url, attempts
        )))
    }

    fn attempt(&self, url: &str, part: &Path, expected: Option<&str>) -> Result<(String, u64)> {
        if part.exists() {
            fs::remove_file(part)
                .with_context(|| format!("removing partial download '{}'", part.display()))?;
        }
        self.transport.download(url, part)?;
        if !part.is_file() {
            bail!("download of {} produced no file", url);
        }

        let (sha256, size) = sha256_file(part)?;
        if let Some(expected) = expected {
            if sha256 != expected {
                bail!(
                    "checksum mismatch for {}\n  expected: {}\n  actual:   {}",
                    url,
                    expected,
                    sha256
                );
            }
        }
        Ok((sha256, size))
    }

    fn try_cached(
        &self,
        dest: &Path,
        expected: Option<&str>,
        digest_source: DigestSource,
    ) -> Result<Option<FetchOutcome>> {
        if !dest.is_file() {
            return Ok(None);
        }

        let Some(expected) = expected else {
            log::warn!(
                "discarding cached {}: no digest to verify it against",
                dest.display()
            );
            fs::remove_file(dest)
                .with_context(|| format!("removing unverifiable '{}'", dest.display()))?;
            return Ok(None);
        };

        let (sha256, size_bytes) = sha256_file(dest)?;
        if sha256 != expected {
            log::warn!(
                "cached {} does not match expected sha256 {} (got {}); downloading again",
                dest.display(),
                expected,
                sha256
            );
            fs::remove_file(dest)
                .with_context(|| format!("removing corrupt '{}'", dest.display()))?;
            return Ok(None);
        }

        log::info!("using cached {} (sha256 verified)", dest.display());
        Ok(Some(FetchOutcome {
            path: dest.to_path_buf(),
            sha256,
            size_bytes,
            source: FetchSource::Cached,
            digest: digest_source,
        }))
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    const TEST_SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    const URL: &str = "http://mirror.invalid/openvswitch-2.4.0.tar.gz";

    /// Serves `payload`, failing the first `failures` calls.
    struct FakeTransport {
        payload: Vec<u8>,
        failures: u32,
        calls: Cell<u32>,
    }

    impl FakeTransport {
        fn new(payload: &[u8], failures: u32) -> Self {
            Self {
                payload: payload.to_vec(),
                failures,
                calls: Cell::new(0),
            }
        }
    }

    impl Transport for FakeTransport {
        fn download(&self, _url: &str, dest: &Path) -> Result<()> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n <= self.failures {
                bail!("connection refused");
            }
            fs::write(dest, &self.payload)?;
            Ok(())
        }
    }

    fn dest(temp: &TempDir) -> PathBuf {
        temp.path().join("downloads/openvswitch-2.4.0.tar.gz")
    }

    #[test]
    fn downloads_and_verifies_configured_digest() {
        let temp = TempDir::new().unwrap();
        let transport = FakeTransport::new(b"test", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap();

        assert_eq!(outcome.sha256, TEST_SHA);
        assert_eq!(outcome.source, FetchSource::Downloaded { attempts: 1 });
        assert_eq!(outcome.digest, DigestSource::Configured);
        assert_eq!(fs::read(dest(&temp)).unwrap(), b"test");
        assert!(!partial_path(&dest(&temp)).exists());
        // configured digests are not duplicated into a sidecar
        assert!(!checksum::sidecar_path(&dest(&temp)).exists());
    }

    #[test]
    fn first_download_without_digest_records_sidecar() {
        let temp = TempDir::new().unwrap();
        let transport = FakeTransport::new(b"test", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), None).unwrap();

        assert_eq!(outcome.digest, DigestSource::FirstUse);
        assert_eq!(
            read_sidecar(&dest(&temp)).unwrap().as_deref(),
            Some(TEST_SHA)
        );
    }

    #[test]
    fn retries_transient_failures() {
        let temp = TempDir::new().unwrap();
        let transport = FakeTransport::new(b"test", 2);
        let fetcher = Fetcher::new(&transport, 3, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap();

        assert_eq!(transport.calls.get(), 3);
        assert_eq!(outcome.source, FetchSource::Downloaded { attempts: 3 });
    }

    #[test]
    fn gives_up_after_all_attempts() {
        let temp = TempDir::new().unwrap();
        let transport = FakeTransport::new(b"test", u32::MAX);
        let fetcher = Fetcher::new(&transport, 2, Duration::ZERO);

        let err = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap_err();

        assert_eq!(transport.calls.get(), 3);
        let msg = format!("{err:#}");
        assert!(msg.contains("after 3 attempt(s)"));
        assert!(msg.contains("connection refused"));
        assert!(!dest(&temp).exists());
    }

    #[test]
    fn checksum_mismatch_never_lands() {
        let temp = TempDir::new().unwrap();
        let transport = FakeTransport::new(b"tampered", 0);
        let fetcher = Fetcher::new(&transport, 1, Duration::ZERO);

        let err = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap_err();

        assert!(format!("{err:#}").contains("checksum mismatch"));
        assert_eq!(transport.calls.get(), 2);
        assert!(!dest(&temp).exists());
        assert!(!partial_path(&dest(&temp)).exists());
    }

    #[test]
    fn verified_cache_skips_download() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(dest(&temp).parent().unwrap()).unwrap();
        fs::write(dest(&temp), b"test").unwrap();
        let transport = FakeTransport::new(b"unused", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap();

        assert_eq!(outcome.source, FetchSource::Cached);
        assert_eq!(transport.calls.get(), 0);
    }

    #[test]
    fn sidecar_verifies_cache() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(dest(&temp).parent().unwrap()).unwrap();
        fs::write(dest(&temp), b"test").unwrap();
        write_sidecar(&dest(&temp), TEST_SHA).unwrap();
        let transport = FakeTransport::new(b"unused", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), None).unwrap();

        assert_eq!(outcome.source, FetchSource::Cached);
        assert_eq!(outcome.digest, DigestSource::Recorded);
        assert_eq!(transport.calls.get(), 0);
    }

    #[test]
    fn corrupt_cache_is_replaced() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(dest(&temp).parent().unwrap()).unwrap();
        fs::write(dest(&temp), b"truncated").unwrap();
        let transport = FakeTransport::new(b"test", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), Some(TEST_SHA)).unwrap();

        assert_eq!(outcome.source, FetchSource::Downloaded { attempts: 1 });
        assert_eq!(fs::read(dest(&temp)).unwrap(), b"test");
    }

    #[test]
    fn unverifiable_cache_is_downloaded_again() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(dest(&temp).parent().unwrap()).unwrap();
        fs::write(dest(&temp), b"whatever").unwrap();
        let transport = FakeTransport::new(b"test", 0);
        let fetcher = Fetcher::new(&transport, 0, Duration::ZERO);

        let outcome = fetcher.fetch(URL, &dest(&temp), None).unwrap();

        assert_eq!(transport.calls.get(), 1);
        assert_eq!(outcome.digest, DigestSource::FirstUse);
    }
}
