//! Attachment retrieval from heterogeneous sources.
//!
//! A spec names where the bytes live (`endpoint`, `http_url`, `base64`,
//! `filesystem`) and optionally an MD5 cache key, either explicit
//! (`content_md5`) or embedded in the filename as an `{MD5:<hex>}` marker.
//! Fetched content is written back to the tiered cache under the MD5 of
//! the actual bytes, deduplicating across storage paths.

use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use postino_cache::TieredCache;
use postino_types::{AttachmentSpec, ClientAuth, FetchMode};
use regex::Regex;

use crate::error::DispatchError;

/// Resolved attachment content with its cleaned filename.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAttachment {
    pub content: Vec<u8>,
    pub filename: String,
}

/// Tenant-derived fetch context: the `endpoint` mode URL and default auth.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub endpoint_url: Option<String>,
    pub auth: Option<ClientAuth>,
}

fn md5_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{MD5:([a-fA-F0-9]+)\}").expect("valid marker regex"))
}

/// Strip an `{MD5:<hex>}` marker from a filename.
///
/// Returns the cleaned filename and the lowercase hash when present:
/// `"report_{MD5:a1b2}.pdf"` becomes `("report.pdf", Some("a1b2"))`.
pub fn parse_filename(raw: &str) -> (String, Option<String>) {
    let Some(captures) = md5_marker().captures(raw) else {
        return (raw.to_string(), None);
    };
    let hash = captures[1].to_ascii_lowercase();
    let mut clean = md5_marker().replace_all(raw, "").to_string();
    while clean.contains("__") {
        clean = clean.replace("__", "_");
    }
    clean = clean.trim_matches('_').to_string();
    clean = clean.replace("_.", ".");
    (clean, Some(hash))
}

/// Router over the four fetch modes with MD5 cache lookup and write-back.
pub struct AttachmentFetcher {
    http: reqwest::Client,
    cache: Option<Arc<TieredCache>>,
    base_dir: Option<PathBuf>,
}

impl AttachmentFetcher {
    pub fn new(
        timeout: Duration,
        cache: Option<Arc<TieredCache>>,
        base_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            cache,
            base_dir,
        })
    }

    /// Retrieve one attachment.
    ///
    /// Returns `None` when the spec carries no `storage_path` (nothing to
    /// fetch). Cache hits short-circuit the backend entirely.
    pub async fn fetch(
        &self,
        spec: &AttachmentSpec,
        ctx: &FetchContext,
    ) -> Result<Option<FetchedAttachment>, DispatchError> {
        let Some(storage_path) = spec.storage_path.as_deref() else {
            return Ok(None);
        };

        let raw_filename = spec.filename.as_deref().unwrap_or("file.bin");
        let (clean_filename, marker_md5) = parse_filename(raw_filename);
        let cache_key = spec.content_md5.clone().or(marker_md5);

        if let (Some(key), Some(cache)) = (&cache_key, &self.cache) {
            if let Some(content) = cache.get(key).await {
                return Ok(Some(FetchedAttachment {
                    content,
                    filename: clean_filename,
                }));
            }
        }

        let auth = spec.auth.as_ref().or(ctx.auth.as_ref());
        let content = match spec.fetch_mode {
            Some(FetchMode::Base64) => decode_base64(storage_path)?,
            Some(FetchMode::Filesystem) => self.read_filesystem(storage_path).await?,
            Some(FetchMode::HttpUrl) => self.http_get(storage_path, auth).await?,
            Some(FetchMode::Endpoint) => {
                let url = ctx.endpoint_url.as_deref().ok_or_else(|| {
                    DispatchError::AttachmentFetch(
                        "no attachment endpoint configured for tenant".into(),
                    )
                })?;
                self.endpoint_post(url, storage_path, auth).await?
            }
            None => {
                return Err(DispatchError::AttachmentFetch(format!(
                    "fetch_mode is required for '{clean_filename}'"
                )));
            }
        };

        if let Some(cache) = &self.cache {
            let key = postino_cache::compute_md5(&content);
            cache.set(&key, &content).await;
        }

        Ok(Some(FetchedAttachment {
            content,
            filename: clean_filename,
        }))
    }

    /// Fetch a batch concurrently, keyed by `storage_path`.
    ///
    /// Failed or empty specs are simply absent from the result; the caller
    /// decides whether a missing attachment fails the message.
    pub async fn fetch_batch(
        &self,
        specs: &[AttachmentSpec],
        ctx: &FetchContext,
    ) -> HashMap<String, FetchedAttachment> {
        let fetches = specs.iter().filter_map(|spec| {
            let storage_path = spec.storage_path.clone()?;
            Some(async move {
                let fetched = self.fetch(spec, ctx).await.ok().flatten()?;
                Some((storage_path, fetched))
            })
        });
        futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Upload rewritten large-file content to the tenant's external
    /// storage; returns the URL to link in the message body.
    pub async fn upload(
        &self,
        storage_url: &str,
        filename: &str,
        content: &[u8],
        auth: Option<&ClientAuth>,
    ) -> Result<String, DispatchError> {
        let url = format!("{}/{}", storage_url.trim_end_matches('/'), filename);
        let request = apply_auth(self.http.put(&url), auth).body(content.to_vec());
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("PUT {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::AttachmentFetch(format!(
                "PUT {url}: status {}",
                response.status()
            )));
        }
        Ok(url)
    }

    async fn read_filesystem(&self, storage_path: &str) -> Result<Vec<u8>, DispatchError> {
        let base = self.base_dir.as_ref().ok_or_else(|| {
            DispatchError::AttachmentFetch("no filesystem base directory configured".into())
        })?;

        let relative = PathBuf::from(storage_path);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir));
        if escapes {
            return Err(DispatchError::AttachmentFetch(format!(
                "path '{storage_path}' escapes the attachment directory"
            )));
        }

        tokio::fs::read(base.join(relative))
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("read '{storage_path}': {e}")))
    }

    async fn http_get(
        &self,
        url: &str,
        auth: Option<&ClientAuth>,
    ) -> Result<Vec<u8>, DispatchError> {
        let request = apply_auth(self.http.get(url), auth);
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::AttachmentFetch(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("GET {url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn endpoint_post(
        &self,
        url: &str,
        storage_path: &str,
        auth: Option<&ClientAuth>,
    ) -> Result<Vec<u8>, DispatchError> {
        let request = apply_auth(self.http.post(url), auth)
            .json(&serde_json::json!({ "storage_path": storage_path }));
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::AttachmentFetch(format!(
                "POST {url}: status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::AttachmentFetch(format!("POST {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Attach a [`ClientAuth`] variant to an outgoing request.
pub fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: Option<&ClientAuth>,
) -> reqwest::RequestBuilder {
    match auth {
        None | Some(ClientAuth::None) => request,
        Some(ClientAuth::Bearer { token }) => request.bearer_auth(token),
        Some(ClientAuth::Basic { user, password }) => {
            request.basic_auth(user, Some(password))
        }
    }
}

fn decode_base64(raw: &str) -> Result<Vec<u8>, DispatchError> {
    // Padding tolerant: whitespace is stripped and '=' padding restored.
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let padded = match compact.len() % 4 {
        0 => compact,
        rem => format!("{compact}{}", "=".repeat(4 - rem)),
    };
    BASE64
        .decode(padded.as_bytes())
        .map_err(|e| DispatchError::AttachmentFetch(format!("invalid base64 content: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use postino_cache::{CacheConfig, TieredCache};
    use postino_types::{AttachmentSpec, ClientAuth, FetchMode};

    use super::{AttachmentFetcher, FetchContext, parse_filename};

    fn fetcher(cache: Option<Arc<TieredCache>>) -> AttachmentFetcher {
        AttachmentFetcher::new(Duration::from_secs(5), cache, None).unwrap()
    }

    fn spec(mode: FetchMode, storage_path: &str) -> AttachmentSpec {
        AttachmentSpec {
            filename: Some("file.bin".into()),
            storage_path: Some(storage_path.into()),
            fetch_mode: Some(mode),
            ..AttachmentSpec::default()
        }
    }

    #[test]
    fn filename_marker_is_stripped() {
        assert_eq!(
            parse_filename("report_{MD5:A1B2C3D4}.pdf"),
            ("report.pdf".into(), Some("a1b2c3d4".into()))
        );
        assert_eq!(parse_filename("plain.pdf"), ("plain.pdf".into(), None));
        assert_eq!(
            parse_filename("{MD5:ff00}_leading.txt"),
            ("leading.txt".into(), Some("ff00".into()))
        );
    }

    #[tokio::test]
    async fn base64_fetch_tolerates_missing_padding() {
        let fetcher = fetcher(None);
        // "postino" encodes to cG9zdGlubw== - strip the padding.
        let result = fetcher
            .fetch(&spec(FetchMode::Base64, "cG9zdGlubw"), &FetchContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, b"postino");
        assert_eq!(result.filename, "file.bin");
    }

    #[tokio::test]
    async fn missing_storage_path_is_not_an_error() {
        let fetcher = fetcher(None);
        let empty = AttachmentSpec {
            filename: Some("x.txt".into()),
            ..AttachmentSpec::default()
        };
        assert!(fetcher.fetch(&empty, &FetchContext::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filesystem_fetch_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("ok.txt"), b"data").await.unwrap();
        let fetcher = AttachmentFetcher::new(
            Duration::from_secs(5),
            None,
            Some(dir.path().to_path_buf()),
        )
        .unwrap();

        let ok = fetcher
            .fetch(&spec(FetchMode::Filesystem, "ok.txt"), &FetchContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.content, b"data");

        let escape = fetcher
            .fetch(
                &spec(FetchMode::Filesystem, "../etc/passwd"),
                &FetchContext::default(),
            )
            .await;
        assert!(escape.is_err());

        let absolute = fetcher
            .fetch(
                &spec(FetchMode::Filesystem, "/etc/passwd"),
                &FetchContext::default(),
            )
            .await;
        assert!(absolute.is_err());
    }

    #[tokio::test]
    async fn endpoint_fetch_posts_storage_path_with_auth() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let url = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            request
                .respond(tiny_http::Response::from_data(b"attachment-bytes".to_vec()))
                .unwrap();
            (auth, body)
        });

        let fetcher = fetcher(None);
        let ctx = FetchContext {
            endpoint_url: Some(url),
            auth: Some(ClientAuth::Bearer { token: "tok-9".into() }),
        };
        let result = fetcher
            .fetch(&spec(FetchMode::Endpoint, "docs/123"), &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, b"attachment-bytes");

        let (auth, body) = handle.join().unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer tok-9"));
        assert!(body.contains("docs/123"));
    }

    #[tokio::test]
    async fn fetch_batch_is_keyed_by_storage_path() {
        let fetcher = fetcher(None);
        let specs = vec![
            spec(FetchMode::Base64, "Zmlyc3Q="),  // "first"
            spec(FetchMode::Base64, "c2Vjb25k"), // "second"
            AttachmentSpec::default(),           // no storage_path: skipped
        ];
        let results = fetcher.fetch_batch(&specs, &FetchContext::default()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["Zmlyc3Q="].content, b"first");
        assert_eq!(results["c2Vjb25k"].content, b"second");
    }

    #[tokio::test]
    async fn cache_hit_skips_the_backend() {
        let cache = Arc::new(TieredCache::new(CacheConfig::default()));
        let content = b"cached-bytes";
        let key = postino_cache::compute_md5(content);
        cache.set(&key, content).await;

        let fetcher = fetcher(Some(cache));
        // Endpoint mode with no endpoint configured would fail on a miss.
        let mut att = spec(FetchMode::Endpoint, "unreachable");
        att.filename = Some(format!("doc_{{MD5:{key}}}.pdf"));

        let result = fetcher
            .fetch(&att, &FetchContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, content);
        assert_eq!(result.filename, "doc.pdf");
    }

    #[tokio::test]
    async fn explicit_content_md5_beats_filename_marker() {
        let cache = Arc::new(TieredCache::new(CacheConfig::default()));
        let content = b"explicit";
        let key = postino_cache::compute_md5(content);
        cache.set(&key, content).await;

        let fetcher = fetcher(Some(cache));
        let mut att = spec(FetchMode::Endpoint, "unreachable");
        att.filename = Some("doc_{MD5:0000000000000000}.pdf".into());
        att.content_md5 = Some(key);

        let result = fetcher
            .fetch(&att, &FetchContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, content);
    }
}
