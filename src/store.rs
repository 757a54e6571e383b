//! Object store backends holding user-submitted images.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use reqwest::{StatusCode, Url, blocking::Client};
use tracing::debug;

use crate::{
    config::{Config, ObjectStoreConfig},
    constants::{USER_IMAGE_PREFIX, USER_IMAGE_SEGMENT},
    error::{StoreError, WorkerError},
};

/// Remote or local blob storage addressed by user id and file name.
pub trait ObjectStore: Send + Sync {
    /// Downloads `users/{uid}/images/{file_name}`.
    fn fetch(&self, uid: &str, file_name: &str) -> Result<Vec<u8>, StoreError>;

    /// Verifies the store answers at all.
    fn ping(&self) -> Result<(), StoreError>;

    /// Project identifier reported on `/health`, if known.
    fn project_id(&self) -> Option<String>;
}

/// Builds the object key for a user image, rejecting traversal attempts.
pub fn object_key(uid: &str, file_name: &str) -> Result<String, StoreError> {
    let key = format!("{USER_IMAGE_PREFIX}/{uid}/{USER_IMAGE_SEGMENT}/{file_name}");
    let invalid = key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid || key.contains('\\') || key.contains('\0') {
        return Err(StoreError::InvalidKey(key));
    }
    Ok(key)
}

/// Firebase Storage accessed through its REST API.
#[derive(Debug, Clone)]
pub struct FirebaseStore {
    client: Client,
    base: Url,
    bucket: String,
    access_token: Option<String>,
    project_id: Option<String>,
}

impl FirebaseStore {
    /// Creates a store for `bucket` behind `endpoint`.
    pub fn new(
        endpoint: &str,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let base = Url::parse(endpoint).map_err(|err| {
            WorkerError::ConfigError(format!("invalid object store endpoint '{endpoint}': {err}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(WorkerError::ConfigError(format!(
                "object store endpoint '{endpoint}' cannot carry a path"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base,
            bucket: bucket.into(),
            access_token: None,
            project_id: None,
        })
    }

    /// Sends `token` as a bearer credential. Blank tokens mean anonymous access.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    /// Sets the project reported by [`ObjectStore::project_id`].
    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id;
        self
    }

    /// `{endpoint}/v0/b/{bucket}/o[/{key}]`, with the key encoded as one segment.
    fn objects_url(&self, key: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v0", "b", self.bucket.as_str(), "o"]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::blocking::RequestBuilder {
        let request = self.client.get(url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ObjectStore for FirebaseStore {
    fn fetch(&self, uid: &str, file_name: &str) -> Result<Vec<u8>, StoreError> {
        let key = object_key(uid, file_name)?;
        let mut url = self.objects_url(Some(&key));
        url.query_pairs_mut().append_pair("alt", "media");

        debug!("Fetching object '{key}' from bucket '{}'", self.bucket);
        let response = self.get(url).send()?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes()?.to_vec()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key)),
            status => Err(StoreError::Status {
                key,
                status: status.as_u16(),
            }),
        }
    }

    fn ping(&self) -> Result<(), StoreError> {
        let mut url = self.objects_url(None);
        url.query_pairs_mut().append_pair("maxResults", "1");

        let response = self.get(url).send()?;
        match response.status() {
            // Listing may be forbidden by bucket rules; the bucket still answered.
            status
                if status.is_success()
                    || status == StatusCode::UNAUTHORIZED
                    || status == StatusCode::FORBIDDEN =>
            {
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(self.bucket.clone())),
            status => Err(StoreError::Status {
                key: self.bucket.clone(),
                status: status.as_u16(),
            }),
        }
    }

    fn project_id(&self) -> Option<String> {
        self.project_id.clone()
    }
}

/// Local directory laid out like the bucket.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Serves objects from below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectStore for DirectoryStore {
    fn fetch(&self, uid: &str, file_name: &str) -> Result<Vec<u8>, StoreError> {
        let key = object_key(uid, file_name)?;
        match fs::read(self.root.join(&key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key)),
            Err(err) => Err(err.into()),
        }
    }

    fn ping(&self) -> Result<(), StoreError> {
        if fs::metadata(&self.root)?.is_dir() {
            Ok(())
        } else {
            Err(StoreError::NotFound(self.root.display().to_string()))
        }
    }

    fn project_id(&self) -> Option<String> {
        None
    }
}

/// Builds the backend selected by the `object_store` section.
pub fn from_config(config: &Config) -> Result<Arc<dyn ObjectStore>, WorkerError> {
    let store: Arc<dyn ObjectStore> = match &config.object_store {
        ObjectStoreConfig::Firebase {
            project_id,
            bucket,
            access_token,
            ..
        } => Arc::new(
            FirebaseStore::new(
                config.object_store.endpoint(),
                bucket.clone(),
                config.object_store.timeout()?,
            )?
            .with_access_token(access_token.clone())
            .with_project_id(project_id.clone()),
        ),
        ObjectStoreConfig::Directory { .. } => {
            let root = config.store_root().ok_or_else(|| {
                WorkerError::ConfigError("directory store requires a root".into())
            })?;
            Arc::new(DirectoryStore::new(root))
        }
    };
    Ok(store)
}
