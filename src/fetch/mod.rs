//! Content store client: local cache plus verified remote downloads
//!
//! Every file reference resolves to `<data_dir>/downloads/<path>`. Remote
//! files are streamed into a `.part` sibling, hashed on the fly, and only
//! renamed into place once the declared hash matches.

mod checksum;

pub use checksum::*;

use crate::config::{Config, HttpConfig};
use crate::error::{Error, Result};
use crate::manifest::FileReference;
use crate::progress::download_bar;
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ContentStore {
    client: Client,
    cache_root: PathBuf,
    progress: bool,
}

impl ContentStore {
    pub fn new(cache_root: impl Into<PathBuf>, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&http.user_agent)
            .timeout(Duration::from_secs(http.timeout_secs))
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache_root: cache_root.into(),
            progress: http.progress,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.downloads_dir(), &config.http)
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Cache location of a reference; rejects paths leaving the cache root
    pub fn cache_path(&self, reference: &FileReference) -> Result<PathBuf> {
        let rel = Path::new(&reference.path);
        let valid = !reference.path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(Error::InvalidPath(format!(
                "file path must be relative to the downloads folder: {}",
                reference.path
            )));
        }
        Ok(self.cache_root.join(rel))
    }

    /// Resolve a reference to a local file, downloading it if needed
    pub async fn fetch(&self, reference: &FileReference, skip_cache: bool) -> Result<PathBuf> {
        let location = self.cache_path(reference)?;
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if skip_cache && location.exists() {
            debug!(path = %location.display(), "Removing cached copy");
            tokio::fs::remove_file(&location).await?;
        }

        let Some(url) = &reference.url else {
            if !location.exists() {
                return Err(Error::MissingSource(location.display().to_string()));
            }
            return Ok(location);
        };

        let expected = reference
            .hash
            .as_deref()
            .map(ExpectedHash::parse)
            .transpose()?;

        if location.exists() {
            match &expected {
                None => {
                    debug!(path = %location.display(), "Using cached copy");
                    return Ok(location);
                }
                Some(expected) => {
                    let path = location.clone();
                    let algorithm = expected.algorithm;
                    let actual = tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
                        .await
                        .map_err(|e| Error::Other(format!("hash task failed: {}", e)))??;
                    if expected.matches(&actual) {
                        debug!(path = %location.display(), "Cached copy verified");
                        return Ok(location);
                    }
                    warn!(
                        path = %location.display(),
                        "Cached copy does not match {}; downloading again",
                        expected
                    );
                    tokio::fs::remove_file(&location).await?;
                }
            }
        }

        self.download(url, &location, expected.as_ref()).await?;
        Ok(location)
    }

    async fn download(&self, url: &str, location: &Path, expected: Option<&ExpectedHash>) -> Result<()> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Fetch {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let part = part_path(location);
        let result = self.stream_to(url, &part, location, expected).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
            return result;
        }
        tokio::fs::rename(&part, location).await?;
        info!(url, path = %location.display(), "Downloaded");
        Ok(())
    }

    async fn stream_to(
        &self,
        url: &str,
        part: &Path,
        location: &Path,
        expected: Option<&ExpectedHash>,
    ) -> Result<()> {
        let fetch_err = |message: String| Error::Fetch {
            url: url.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }

        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| url.to_string());
        let bar = self
            .progress
            .then(|| download_bar(&name, response.content_length()));

        let mut file = tokio::fs::File::create(part).await?;
        let mut hasher = expected.map(ExpectedHash::hasher);

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            if let Some(bar) = &bar {
                bar.inc(chunk.len() as u64);
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            let actual = hasher.finalize_hex();
            if !expected.matches(&actual) {
                return Err(Error::Integrity {
                    file: name,
                    expected: expected.to_string(),
                    actual: format!("{}:{}", expected.algorithm, actual),
                });
            }
        }
        Ok(())
    }
}

fn part_path(location: &Path) -> PathBuf {
    let mut name = location
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    location.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn store(tmp: &TempDir) -> ContentStore {
        let mut http = HttpConfig::default();
        http.progress = false;
        ContentStore::new(tmp.path().join("downloads"), &http).unwrap()
    }

    fn reference(path: &str, url: Option<String>, hash: Option<&str>) -> FileReference {
        FileReference {
            name: None,
            path: path.to_string(),
            url,
            hash: hash.map(str::to_string),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_download_verifies_and_caches() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let r = reference(
            "greetings/hello.txt",
            Some(format!("{}/hello.txt", mock_server.uri())),
            Some(&format!("sha256:{}", HELLO_SHA256)),
        );

        let local = store.fetch(&r, false).await.unwrap();
        assert_eq!(local, tmp.path().join("downloads/greetings/hello.txt"));
        assert_eq!(std::fs::read(&local).unwrap(), b"hello");

        // Second fetch is served from the verified cache
        store.fetch(&r, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_nothing_cached() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&mock_server)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let r = reference(
            "bad.txt",
            Some(format!("{}/bad.txt", mock_server.uri())),
            Some(HELLO_SHA256),
        );

        let err = store.fetch(&r, false).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(!tmp.path().join("downloads/bad.txt").exists());
        assert!(!tmp.path().join("downloads/bad.txt.part").exists());
    }

    #[tokio::test]
    async fn test_skip_cache_redownloads() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let cached = tmp.path().join("downloads/data.csv");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"stale").unwrap();

        let r = reference("data.csv", Some(format!("{}/data.csv", mock_server.uri())), None);
        let local = store.fetch(&r, true).await.unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_http_error_is_fetch_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let tmp = TempDir::new().unwrap();
        let r = reference("gone.zip", Some(format!("{}/gone.zip", mock_server.uri())), None);
        assert!(matches!(
            store(&tmp).fetch(&r, false).await,
            Err(Error::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let tmp = TempDir::new().unwrap();
        let r = reference("nowhere/file.shp", None, None);
        assert!(matches!(
            store(&tmp).fetch(&r, false).await,
            Err(Error::MissingSource(_))
        ));
    }

    #[tokio::test]
    async fn test_local_file_without_url() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("downloads/local/a.geojson");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"{}").unwrap();

        let r = reference("local/a.geojson", None, None);
        assert_eq!(store(&tmp).fetch(&r, false).await.unwrap(), local);
    }

    #[tokio::test]
    async fn test_non_http_url_rejected() {
        let tmp = TempDir::new().unwrap();
        let r = reference("a.zip", Some("ftp://example.com/a.zip".to_string()), None);
        assert!(matches!(
            store(&tmp).fetch(&r, false).await,
            Err(Error::Fetch { .. })
        ));

        let r = reference("b.zip", Some("not a url".to_string()), None);
        assert!(matches!(
            store(&tmp).fetch(&r, false).await,
            Err(Error::UrlParse(_))
        ));
    }

    #[test]
    fn test_cache_path_rejects_escapes() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.cache_path(&reference("../x", None, None)).is_err());
        assert!(store.cache_path(&reference("/etc/x", None, None)).is_err());
        assert!(store.cache_path(&reference("", None, None)).is_err());
    }
}
