use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Retrieves archives and brokerpaks from URLs or local paths.
///
/// Cache layout when a cache directory is configured:
///   <cache>/<sha256 of url>/<file name>
pub struct Fetcher {
    http: reqwest::Client,
    cache: Option<PathBuf>,
}

impl Fetcher {
    pub fn new(cache: Option<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache,
        }
    }

    fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let root = self.cache.as_ref()?;
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        let name = url.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("download");
        Some(root.join(key).join(name))
    }

    /// Fetch `url` into `dest`, consulting the cache first.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(cached) = self.cache_path(url) {
            if cached.exists() {
                debug!(url, cache = %cached.display(), "using cached download");
                fs::copy(&cached, dest)?;
                return Ok(());
            }
            self.fetch_uncached(url, dest).await?;
            if let Some(parent) = cached.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(dest, &cached)
                .with_context(|| format!("failed to populate cache at {}", cached.display()))?;
            return Ok(());
        }

        self.fetch_uncached(url, dest).await
    }

    async fn fetch_uncached(&self, url: &str, dest: &Path) -> Result<()> {
        if is_remote(url) {
            tracing::info!(url, "downloading");
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .with_context(|| format!("failed to download {url}"))?
                .error_for_status()
                .with_context(|| format!("failed to download {url}"))?;
            let bytes = resp.bytes().await?;
            fs::write(dest, &bytes)?;
        } else {
            let local = url.strip_prefix("file://").unwrap_or(url);
            fs::copy(local, dest).with_context(|| format!("couldn't copy {local}"))?;
        }
        Ok(())
    }
}

pub fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected.trim(),
            actual
        );
    }
    Ok(())
}

/// Extract entries of a zip archive whose file name satisfies `keep`.
///
/// Directory structure inside the archive is flattened. Returns the written paths.
pub fn extract_matching(archive_path: &Path, dest_dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", archive_path.display()))?;
    fs::create_dir_all(dest_dir)?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = Path::new(entry.name()).file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !keep(&name) {
            continue;
        }
        let out_path = dest_dir.join(&name);
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        super::reader::make_executable(&out_path)?;
        written.push(out_path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_fetch_populates_cache() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("thing.zip");
        fs::write(&src, b"payload").unwrap();
        let cache = dir.path().join("cache");

        let fetcher = Fetcher::new(Some(cache.clone()));
        let dest = dir.path().join("out/thing.zip");
        fetcher.fetch(src.to_str().unwrap(), &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        fs::remove_file(&src).unwrap();
        let again = dir.path().join("out/again.zip");
        fetcher.fetch(src.to_str().unwrap(), &again).await.unwrap();
        assert_eq!(fs::read(&again).unwrap(), b"payload");
    }

    #[test]
    fn checksum_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        verify_sha256(&path, good).unwrap();
        let err = verify_sha256(&path, "00").unwrap_err().to_string();
        assert!(err.contains("checksum mismatch"));
    }

    #[test]
    fn extracts_only_matching_entries() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("a.zip");
        {
            let mut w = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            let opts = zip::write::SimpleFileOptions::default();
            w.start_file("nested/tofu", opts).unwrap();
            w.write_all(b"bin").unwrap();
            w.start_file("LICENSE", opts).unwrap();
            w.write_all(b"text").unwrap();
            w.finish().unwrap();
        }
        let out = extract_matching(&zip_path, &dir.path().join("x"), |n| n == "tofu").unwrap();
        assert_eq!(out, vec![dir.path().join("x/tofu")]);
    }
}
