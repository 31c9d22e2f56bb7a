use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use snapvault_types::error::{Result, SnapError};

use crate::http_util::{extract_content_length, extract_etag};
use crate::retry::{classify_http, retry_http, retry_transient, RetryPolicy};
use crate::{ObjectBody, ObjectMeta, ObjectStore, ObjectStoreConfig};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Default per-call deadline when the caller doesn't supply one.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// S3-compatible object store backend.
///
/// Holds a single long-lived `ureq::Agent` so connections are reused
/// across calls; the agent is safe to share across worker threads.
#[derive(Debug)]
pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl S3Store {
    pub fn new(cfg: &ObjectStoreConfig) -> Result<Self> {
        Self::with_timeout(cfg, DEFAULT_OP_TIMEOUT)
    }

    pub fn with_timeout(cfg: &ObjectStoreConfig, op_timeout: Duration) -> Result<Self> {
        let base_url = cfg.endpoint.parse().map_err(|e| {
            SnapError::Config(format!("invalid S3 endpoint URL '{}': {e}", cfg.endpoint))
        })?;

        // Endpoint is always explicit in config; use path-style addressing
        // so S3-compatible stores (MinIO etc.) work without DNS games.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            cfg.bucket.clone(),
            cfg.region.clone(),
        )
        .map_err(|e| SnapError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(&cfg.access_key, &cfg.secret_key);

        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(op_timeout)
            .timeout_read(op_timeout)
            .timeout_write(op_timeout);

        if let Some(proxy_url) = &cfg.proxy_url {
            let proxy = ureq::Proxy::new(proxy_url)
                .map_err(|e| SnapError::Config(format!("invalid proxy URL '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        if !cfg.tls_verify {
            tracing::warn!(
                "TLS certificate verification disabled for object store; \
                 only use this behind a trusted TLS-intercepting proxy"
            );
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| SnapError::Config(format!("failed to build TLS connector: {e}")))?;
            builder = builder.tls_connector(Arc::new(connector));
        }

        Ok(Self {
            bucket,
            credentials,
            agent: builder.build(),
            retry: cfg.retry.clone(),
        })
    }
}

impl ObjectStore for S3Store {
    fn get(&self, key: &str) -> Result<Option<ObjectBody>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let op = format!("S3 GET {key}");

        retry_transient(&self.retry, &op, || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => {
                    let etag = extract_etag(&resp);
                    let mut data = Vec::new();
                    resp.into_reader().read_to_end(&mut data).map_err(|e| {
                        if crate::retry::is_retryable_io(&e) {
                            SnapError::Transient(format!("{op}: body read: {e}"))
                        } else {
                            SnapError::Fatal(format!("{op}: body read: {e}"))
                        }
                    })?;
                    Ok(Some(ObjectBody { data, etag }))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(classify_http(&op, e)),
            }
        })
    }

    fn put(&self, key: &str, data: &[u8], if_match: Option<&str>) -> Result<Option<String>> {
        let mut action = self.bucket.put_object(Some(&self.credentials), key);
        if let Some(etag) = if_match {
            // The header must be both signed into the URL and sent on the
            // wire, like any signed header with presigned requests.
            action
                .headers_mut()
                .insert("if-match", format!("\"{etag}\""));
        }
        let url = action.sign(PRESIGN_DURATION);
        let op = format!("S3 PUT {key}");

        let resp = retry_http(&self.retry, &op, || {
            let mut req = self.agent.put(url.as_str());
            if let Some(etag) = if_match {
                req = req.set("If-Match", &format!("\"{etag}\""));
            }
            req.send_bytes(data)
        })
        .map_err(|e| match e {
            ureq::Error::Status(404, _) => {
                // A conditional put against a deleted key: surface as a lost
                // race so the CAS loop re-reads, same as 412.
                SnapError::PreconditionFailed(key.to_string())
            }
            other => classify_http(&op, other),
        })?;

        Ok(extract_etag(&resp))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let op = format!("S3 DELETE {key}");

        match retry_http(&self.retry, &op, || self.agent.delete(url.as_str()).call()) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(classify_http(&op, e)),
        }
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let op = format!("S3 HEAD {key}");

        match retry_http(&self.retry, &op, || self.agent.head(url.as_str()).call()) {
            Ok(resp) => {
                let size = extract_content_length(&resp, &op)?;
                Ok(Some(ObjectMeta {
                    key: key.to_string(),
                    size,
                    etag: extract_etag(&resp),
                }))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(classify_http(&op, e)),
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<(Vec<ObjectMeta>, Option<String>)> {
        let op = format!("S3 LIST {prefix}");

        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.query_mut().insert("prefix", prefix);
        if let Some(token) = token {
            action.query_mut().insert("continuation-token", token);
        }
        let url = action.sign(PRESIGN_DURATION);

        let parsed = retry_transient(&self.retry, &op, || {
            let resp = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| classify_http(&op, e))?;
            let mut body = Vec::new();
            resp.into_reader().read_to_end(&mut body).map_err(|e| {
                if crate::retry::is_retryable_io(&e) {
                    SnapError::Transient(format!("{op}: body read: {e}"))
                } else {
                    SnapError::Fatal(format!("{op}: body read: {e}"))
                }
            })?;
            let body_str = std::str::from_utf8(&body)
                .map_err(|e| SnapError::Fatal(format!("{op}: response not valid utf-8: {e}")))?;
            ListObjectsV2::parse_response(body_str)
                .map_err(|e| SnapError::Fatal(format!("{op}: failed to parse response: {e}")))
        })?;

        let mut page = Vec::with_capacity(parsed.contents.len());
        for obj in &parsed.contents {
            // Skip directory markers.
            if obj.key.ends_with('/') {
                continue;
            }
            page.push(ObjectMeta {
                key: obj.key.clone(),
                size: obj.size,
                etag: Some(obj.etag.trim_matches('"').to_string()),
            });
        }

        Ok((page, parsed.next_continuation_token))
    }
}
