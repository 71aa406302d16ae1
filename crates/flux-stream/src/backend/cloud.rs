//! `object_store` backend

use super::{BackendError, PartToken, RemoteObject};
use crate::runtime::shared_runtime;
use bytes::Bytes;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{MultipartId, ObjectStore, PutPayload};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::runtime::Runtime;
use tracing::debug;
use url::Url;

/// Represents a path in cloud storage
#[derive(Debug, Clone)]
pub struct CloudPath {
    /// The cloud storage scheme (s3, gs, az)
    pub scheme: String,
    /// The bucket or container name
    pub bucket: String,
    /// The object path within the bucket
    pub path: Path,
}

impl CloudPath {
    /// Parse a cloud URL like "s3://bucket/path/to/object"
    pub fn parse(url: &str) -> Result<Self, BackendError> {
        let parsed = Url::parse(url)
            .map_err(|e| BackendError::InvalidRequest(format!("Invalid URL: {}", e)))?;

        let scheme = parsed.scheme().to_string();
        if !["s3", "gs", "az", "azblob"].contains(&scheme.as_str()) {
            return Err(BackendError::InvalidRequest(format!(
                "Unsupported scheme: {}. Use s3://, gs://, or az://",
                scheme
            )));
        }

        let bucket = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BackendError::InvalidRequest("Missing bucket name".to_string()))?
            .to_string();

        let key = parsed.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(BackendError::InvalidRequest(
                "Missing object key".to_string(),
            ));
        }

        Ok(CloudPath {
            scheme,
            bucket,
            path: Path::from(key),
        })
    }
}

/// One object inside an `object_store` store
///
/// Async store calls are driven to completion on a shared Tokio runtime, so
/// every method blocks the calling (pool) thread.
#[derive(Debug)]
pub struct ObjectStoreObject<S> {
    store: Arc<S>,
    path: Path,
    runtime: Arc<Runtime>,
    size: OnceLock<u64>,
    upload_id: Mutex<Option<MultipartId>>,
}

impl<S> ObjectStoreObject<S>
where
    S: ObjectStore + MultipartStore,
{
    /// Wrap `path` inside `store`, using the shared runtime
    pub fn new(store: Arc<S>, path: Path) -> Result<Self, BackendError> {
        let runtime = shared_runtime()
            .map_err(|e| BackendError::Other(format!("Failed to create Tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(store, path, runtime))
    }

    /// Wrap `path` inside `store`, driving futures on `runtime`
    pub fn with_runtime(store: Arc<S>, path: Path, runtime: Arc<Runtime>) -> Self {
        Self {
            store,
            path,
            runtime,
            size: OnceLock::new(),
            upload_id: Mutex::new(None),
        }
    }

    /// The object path within the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn head_size(&self) -> Result<u64, BackendError> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let meta = self
            .runtime
            .block_on(async { self.store.head(&self.path).await })
            .map_err(translate)?;
        Ok(*self.size.get_or_init(|| meta.size as u64))
    }

    /// Multipart upload id, created on first use
    fn upload_id(&self) -> Result<MultipartId, BackendError> {
        let mut guard = self.upload_id.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        debug!("Starting multipart upload for {}", self.path);
        let id = self
            .runtime
            .block_on(async { self.store.create_multipart(&self.path).await })
            .map_err(translate)?;
        *guard = Some(id.clone());
        Ok(id)
    }
}

fn translate(err: object_store::Error) -> BackendError {
    match err {
        object_store::Error::NotFound { path, .. } => BackendError::NotFound(path),
        other => BackendError::ObjectStore(other),
    }
}

impl<S> RemoteObject for ObjectStoreObject<S>
where
    S: ObjectStore + MultipartStore,
{
    fn name(&self) -> String {
        format!("{}/{}", self.store, self.path)
    }

    fn object_size(&self) -> Result<Option<u64>, BackendError> {
        self.head_size().map(Some)
    }

    fn fetch_range(&self, offset: u64, length: u64) -> Result<Bytes, BackendError> {
        let size = self.head_size()?;
        if offset >= size {
            return Err(BackendError::RangeNotSatisfiable { offset });
        }
        let end = offset.saturating_add(length).min(size);

        self.runtime
            .block_on(async {
                self.store
                    .get_range(&self.path, offset as usize..end as usize)
                    .await
            })
            .map_err(translate)
    }

    fn put_part(&self, index: usize, data: Bytes) -> Result<PartToken, BackendError> {
        let id = self.upload_id()?;
        let size = data.len() as u64;
        let part = self
            .runtime
            .block_on(async {
                self.store
                    .put_part(&self.path, &id, index - 1, PutPayload::from(data))
                    .await
            })
            .map_err(translate)?;
        Ok(PartToken {
            index,
            id: part.content_id,
            size,
        })
    }

    fn complete_upload(&self, tokens: Vec<PartToken>) -> Result<(), BackendError> {
        let id = self.upload_id()?;
        let parts = tokens
            .into_iter()
            .map(|token| PartId {
                content_id: token.id,
            })
            .collect();
        debug!("Completing multipart upload for {}", self.path);
        self.runtime
            .block_on(async { self.store.complete_multipart(&self.path, &id, parts).await })
            .map_err(translate)?;
        *self.upload_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn abort_upload(&self) -> Result<(), BackendError> {
        let id = self
            .upload_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(id) = id else {
            return Ok(());
        };
        debug!("Aborting multipart upload for {}", self.path);
        self.runtime
            .block_on(async { self.store.abort_multipart(&self.path, &id).await })
            .map_err(translate)
    }
}

/// Build a remote object for a cloud URL, with credentials from the environment
///
/// Supports URLs like:
/// - `s3://bucket/path/to/object`
/// - `gs://bucket/path/to/object`
/// - `az://container/path/to/object`
pub fn open_url(url: &str) -> Result<Arc<dyn RemoteObject>, BackendError> {
    let cloud_path = CloudPath::parse(url)?;

    match cloud_path.scheme.as_str() {
        #[cfg(feature = "aws")]
        "s3" => {
            let store = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(&cloud_path.bucket)
                .build()?;
            Ok(Arc::new(ObjectStoreObject::new(Arc::new(store), cloud_path.path)?))
        }
        #[cfg(feature = "gcp")]
        "gs" => {
            let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(&cloud_path.bucket)
                .build()?;
            Ok(Arc::new(ObjectStoreObject::new(Arc::new(store), cloud_path.path)?))
        }
        #[cfg(feature = "azure")]
        "az" | "azblob" => {
            let store = object_store::azure::MicrosoftAzureBuilder::from_env()
                .with_container_name(&cloud_path.bucket)
                .build()?;
            Ok(Arc::new(ObjectStoreObject::new(Arc::new(store), cloud_path.path)?))
        }
        other => Err(BackendError::InvalidRequest(format!(
            "Scheme {} is not enabled in this build",
            other
        ))),
    }
}
