//! Routing of asset messages to the relay.
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{error, info};

use crate::{error::AssetError, relay::AssetRelay};

/// Generation task an asset is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
pub enum TaskKind {
    /// Image to video.
    #[strum(serialize = "img2vid")]
    Img2Vid,
    /// Text to image, conditioned on a reference image.
    #[strum(serialize = "txt2img")]
    Txt2Img,
}

/// An image asset request, as produced by the upstream queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMessage {
    /// Owner of the image.
    pub uid: String,
    /// Name of the image below the owner's image folder.
    pub file_name: String,
    /// Requested task, kept raw so unknown kinds can be reported.
    pub task_type: String,
}

/// Dispatches asset messages by task kind.
#[derive(Clone)]
pub struct AssetHandler {
    relay: AssetRelay,
}

impl AssetHandler {
    /// Wraps `relay`.
    pub fn new(relay: AssetRelay) -> Self {
        Self { relay }
    }

    /// Routes `message` according to `task_type` and returns the provisioned file name.
    pub fn route(&self, task_type: &str, message: &AssetMessage) -> Result<String, AssetError> {
        match TaskKind::from_str(task_type) {
            Ok(TaskKind::Img2Vid | TaskKind::Txt2Img) => self.process_image(message),
            Err(_) => {
                error!("Rejected asset for user '{}': unknown task type '{task_type}'", message.uid);
                Err(AssetError::UnknownTaskType(task_type.to_string()))
            }
        }
    }

    /// Relays the image referenced by `message`.
    pub fn process_image(&self, message: &AssetMessage) -> Result<String, AssetError> {
        info!(
            "Processing image asset for user '{}', file '{}'",
            message.uid, message.file_name
        );
        match self.relay.relay(&message.uid, &message.file_name) {
            Ok(name) => {
                info!("Image asset ready for the engine as '{name}'");
                Ok(name)
            }
            Err(err) => {
                error!("Asset handling failed: {err}");
                Err(err.into())
            }
        }
    }
}
