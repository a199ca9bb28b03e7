//! S3-compatible backend over presigned URLs. Uploads are made idempotent
//! with a HEAD pre-check; the remote digest index comes from ListObjectsV2,
//! preferring the ETag (which for single-part uploads is the MD5 of the
//! object) and falling back to the content-addressed file name.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::{debug, warn};

use crate::addr;
use crate::config::S3StorageConfig;
use crate::error::{CasbakError, Result};
use crate::storage::{validate_key, StorageBackend, UploadOutcome, MANIFEST_PREFIX};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    storage_tier: Option<String>,
}

impl S3Backend {
    pub fn new(cfg: &S3StorageConfig) -> Result<Self> {
        let base_url = cfg.endpoint.parse().map_err(|e| {
            CasbakError::Config(format!("invalid S3 endpoint URL '{}': {e}", cfg.endpoint))
        })?;

        // Endpoint is always explicit; use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            cfg.bucket.clone(),
            cfg.region.clone(),
        )
        .map_err(|e| CasbakError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(&cfg.access_key_id, &cfg.secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            storage_tier: cfg.storage_tier.clone(),
        })
    }

    fn head(&self, key: &str) -> std::result::Result<bool, ureq::Error> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        match self.agent.head(url.as_str()).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// An ETag is usable as a digest only when it is a plain single-part MD5:
/// 32 hex characters, no multipart `-N` suffix.
fn digest_from_etag(etag: &str) -> Option<String> {
    let etag = etag.trim_matches('"');
    if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(etag.to_ascii_lowercase())
    } else {
        None
    }
}

impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    fn upload_file(&self, path: &Path, key: &str) -> Result<UploadOutcome> {
        validate_key(key)?;

        // HEAD pre-check keeps re-uploads cheap and the operation idempotent.
        match self.head(key) {
            Ok(true) => {
                debug!(key, "destination object already present");
                return Ok(UploadOutcome::AlreadyPresent);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key, error = %e, "S3 HEAD failed");
                return Ok(UploadOutcome::Failed);
            }
        }

        let (file, len) = match File::open(path).and_then(|f| {
            let len = f.metadata()?.len();
            Ok((f, len))
        }) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(key, error = %e, "cannot open source file");
                return Ok(UploadOutcome::Failed);
            }
        };

        let mut action = self.bucket.put_object(Some(&self.credentials), key);
        if let Some(tier) = &self.storage_tier {
            action.headers_mut().insert("x-amz-storage-class", tier);
        }
        let url = action.sign(PRESIGN_DURATION);

        let mut request = self
            .agent
            .put(url.as_str())
            .set("Content-Length", &len.to_string());
        if let Some(tier) = &self.storage_tier {
            request = request.set("x-amz-storage-class", tier);
        }

        match request.send(file) {
            Ok(_) => Ok(UploadOutcome::Uploaded),
            Err(e) => {
                warn!(key, error = %e, "S3 PUT failed");
                Ok(UploadOutcome::Failed)
            }
        }
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        self.agent
            .put(url.as_str())
            .send_bytes(data)
            .map_err(|e| CasbakError::Storage(format!("S3 PUT {key}: {e}")))?;
        Ok(())
    }

    fn digest_index(&self) -> Result<HashMap<String, u64>> {
        use std::io::Read;

        let mut digests = HashMap::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| CasbakError::Storage(format!("S3 LIST: {e}")))?;
            let mut body = String::new();
            resp.into_reader()
                .read_to_string(&mut body)
                .map_err(|e| CasbakError::Storage(format!("S3 LIST body: {e}")))?;
            let parsed = ListObjectsV2::parse_response(&body)
                .map_err(|e| CasbakError::Storage(format!("S3 LIST parse: {e}")))?;

            for obj in &parsed.contents {
                let key = &obj.key;
                if key.ends_with('/') || key.starts_with(MANIFEST_PREFIX) {
                    continue;
                }
                let digest = digest_from_etag(&obj.etag).or_else(|| addr::digest_from_key(key));
                match digest {
                    Some(digest) => {
                        digests.insert(digest, obj.size);
                    }
                    None => debug!(key, "skipping unrecognized destination object"),
                }
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_accepted_only_when_plain_md5() {
        assert_eq!(
            digest_from_etag("\"5eb63bbbe01eeed093cb22bb8f5acdc3\"").as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(
            digest_from_etag("5EB63BBBE01EEED093CB22BB8F5ACDC3").as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        // Multipart uploads carry a -N suffix and are not usable.
        assert_eq!(digest_from_etag("\"abc123-4\""), None);
        assert_eq!(digest_from_etag("\"short\""), None);
    }
}
