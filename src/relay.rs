//! Relay of user images from the object store into the engine's input directory.
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayStage, StoreError},
    store::ObjectStore,
};

/// Linear fetch, store and provision pipeline. No retries.
#[derive(Clone)]
pub struct AssetRelay {
    store: Arc<dyn ObjectStore>,
    input_dir: PathBuf,
}

impl AssetRelay {
    /// Relays from `store` into `input_dir`.
    pub fn new(store: Arc<dyn ObjectStore>, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            input_dir: input_dir.into(),
        }
    }

    /// Directory generated files are written to.
    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Runs the full pipeline and returns the name the workflow should reference.
    pub fn relay(&self, uid: &str, file_name: &str) -> Result<String, RelayError> {
        info!("Relaying image '{file_name}' for user '{uid}'");

        let bytes = self.fetch(uid, file_name)?;
        let stored = self.store(&bytes, file_name)?;
        let provisioned = self.provision(stored)?;

        info!("Relay of '{file_name}' completed as '{provisioned}'");
        Ok(provisioned)
    }

    /// Downloads the original image.
    pub fn fetch(&self, uid: &str, file_name: &str) -> Result<Vec<u8>, RelayError> {
        let bytes = self
            .store
            .fetch(uid, file_name)
            .map_err(|source| stage_failure(RelayStage::Fetch, source))?;
        debug!("Fetched {} bytes for '{file_name}'", bytes.len());
        Ok(bytes)
    }

    /// Writes `bytes` under a fresh `<uuid>.<ext>` name and returns that name.
    pub fn store(&self, bytes: &[u8], original_name: &str) -> Result<String, RelayError> {
        let name = generated_name(original_name);
        let path = self.input_dir.join(&name);

        if !self.input_dir.is_dir() {
            fs::create_dir_all(&self.input_dir)
                .map_err(|err| stage_failure(RelayStage::Store, err.into()))?;
            info!("Created input directory {}", self.input_dir.display());
        }
        write_then_rename(&self.input_dir, &name, bytes)
            .map_err(|err| stage_failure(RelayStage::Store, err.into()))?;

        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(name)
    }

    /// Hands the stored name to the workflow. Currently a pass-through.
    pub fn provision(&self, name: String) -> Result<String, RelayError> {
        debug!("Provisioned file name for workflow: {name}");
        Ok(name)
    }
}

fn stage_failure(stage: RelayStage, source: StoreError) -> RelayError {
    warn!("Asset relay failed at {stage} stage: {source}");
    RelayError::StageFailure { stage, source }
}

/// Writes `bytes` to a hidden `.partial` sibling and renames it into place.
/// The engine never sees a truncated file, and a failed write leaves nothing behind.
fn write_then_rename(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let partial = dir.join(format!(".{name}.partial"));
    let written = fs::write(&partial, bytes).and_then(|()| fs::rename(&partial, dir.join(name)));
    if written.is_err() {
        let _ = fs::remove_file(&partial);
    }
    written
}

/// UUID v4 plus the extension of `original_name`, if it has one.
fn generated_name(original_name: &str) -> String {
    let id = Uuid::new_v4();
    match Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some(ext) if !ext.is_empty() => format!("{id}.{ext}"),
        _ => id.to_string(),
    }
}
