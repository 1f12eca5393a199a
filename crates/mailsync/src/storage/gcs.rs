//! Google Cloud Storage object store
//!
//! Uses the JSON API over synchronous HTTP (ureq). Conditional create relies
//! on `ifGenerationMatch=0`, which the service evaluates atomically.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use url::Url;

use super::ObjectStore;
use crate::imap::TokenSource;

/// Object store backed by a GCS bucket
pub struct GcsObjectStore {
    bucket: String,
    endpoint: Url,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl GcsObjectStore {
    const DEFAULT_ENDPOINT: &'static str = "https://storage.googleapis.com";

    /// Create a store for `bucket` on the public endpoint
    pub fn new(bucket: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let mut store = Self::with_endpoint(bucket, Self::DEFAULT_ENDPOINT)?;
        store.tokens = Some(tokens);
        Ok(store)
    }

    /// Create an unauthenticated store against a custom endpoint (e.g. an emulator)
    pub fn with_endpoint(bucket: impl Into<String>, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))
            .with_context(|| format!("Invalid storage endpoint: {}", endpoint))?;
        Ok(Self {
            bucket: bucket.into(),
            endpoint,
            tokens: None,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn base(&self) -> String {
        self.endpoint.as_str().trim_end_matches('/').to_string()
    }

    fn object_url(&self, name: &str) -> Result<Url> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base(),
            urlencoding::encode(&self.bucket),
            urlencoding::encode(name)
        );
        Url::parse(&url).context("Failed to build object URL")
    }

    fn media_url(&self, name: &str) -> Result<Url> {
        let mut url = self.object_url(name)?;
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    fn upload_url(&self, name: &str, if_absent: bool) -> Result<Url> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base(),
            urlencoding::encode(&self.bucket)
        );
        let mut url = Url::parse(&url).context("Failed to build upload URL")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media").append_pair("name", name);
            if if_absent {
                query.append_pair("ifGenerationMatch", "0");
            }
        }
        Ok(url)
    }

    fn authorization(&self) -> Result<Option<String>> {
        match &self.tokens {
            Some(tokens) => {
                let token = tokens
                    .bearer_token()
                    .context("Failed to obtain storage access token")?;
                Ok(Some(format!("Bearer {}", token)))
            }
            None => Ok(None),
        }
    }

    fn upload(&self, name: &str, data: &[u8], if_absent: bool) -> Result<bool> {
        let url = self.upload_url(name, if_absent)?;
        let mut request = ureq::post(url.as_str()).header("Content-Type", "application/octet-stream");
        if let Some(auth) = self.authorization()? {
            request = request.header("Authorization", &auth);
        }

        match request.send(data) {
            Ok(_) => {
                debug!("Uploaded gs://{}/{} ({} bytes)", self.bucket, name, data.len());
                Ok(true)
            }
            Err(ureq::Error::StatusCode(412)) if if_absent => Ok(false),
            Err(e) => Err(anyhow::anyhow!("Failed to upload {}: {}", name, e)),
        }
    }
}

impl ObjectStore for GcsObjectStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let url = self.media_url(name)?;
        let mut request = ureq::get(url.as_str());
        if let Some(auth) = self.authorization()? {
            request = request.header("Authorization", &auth);
        }

        match request.call() {
            Ok(mut resp) => {
                let data = resp
                    .body_mut()
                    .read_to_vec()
                    .with_context(|| format!("Failed to read object {}", name))?;
                Ok(Some(data))
            }
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to get {}: {}", name, e)),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.upload(name, data, false).map(|_| ())
    }

    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<bool> {
        self.upload(name, data, true)
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let url = self.object_url(name)?;
        let mut request = ureq::delete(url.as_str());
        if let Some(auth) = self.authorization()? {
            request = request.header("Authorization", &auth);
        }

        match request.call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::StatusCode(404)) => Ok(false),
            Err(e) => Err(anyhow::anyhow!("Failed to delete {}: {}", name, e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let url = self.object_url(name)?;
        let mut request = ureq::get(url.as_str());
        if let Some(auth) = self.authorization()? {
            request = request.header("Authorization", &auth);
        }

        match request.call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::StatusCode(404)) => Ok(false),
            Err(e) => Err(anyhow::anyhow!("Failed to stat {}: {}", name, e)),
        }
    }

    /// Streams the object to disk instead of buffering it
    fn download_to(&self, name: &str, path: &Path) -> Result<bool> {
        let url = self.media_url(name)?;
        let mut request = ureq::get(url.as_str());
        if let Some(auth) = self.authorization()? {
            request = request.header("Authorization", &auth);
        }

        let mut resp = match request.call() {
            Ok(resp) => resp,
            Err(ureq::Error::StatusCode(404)) => return Ok(false),
            Err(e) => return Err(anyhow::anyhow!("Failed to download {}: {}", name, e)),
        };

        let mut file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let bytes = io::copy(&mut resp.body_mut().as_reader(), &mut file)
            .with_context(|| format!("Failed to download {}", name))?;
        file.sync_all()?;
        debug!("Downloaded gs://{}/{} ({} bytes)", self.bucket, name, bytes);
        Ok(true)
    }
}
