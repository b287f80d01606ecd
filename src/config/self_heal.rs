//! Config self-heal hook
//!
//! When the config file fails to parse, a `model_folders.json` sidecar next
//! to it describes the model directories the auto-setup collaborator scans
//! to regenerate a working config. The collaborator itself lives outside
//! this binary; here we only read the sidecar and report whether a
//! regeneration source exists, so the caller can decide between exiting
//! (startup) and keeping the old snapshot (reload).

use serde::Deserialize;
use std::path::Path;

/// `model_folders.json` shape
#[derive(Debug, Deserialize)]
struct ModelFolders {
    #[serde(default)]
    folders: Vec<Folder>,
}

#[derive(Debug, Deserialize)]
struct Folder {
    path: String,
    #[serde(default)]
    enabled: bool,
}

/// Inspect the sidecar and hand the regeneration opportunity to the
/// auto-setup collaborator. Returns true only if the config file may have
/// been rewritten and a re-parse is worth attempting.
pub fn try_self_heal(config_path: &Path) -> bool {
    let sidecar = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("model_folders.json");

    let text = match std::fs::read_to_string(&sidecar) {
        Ok(text) => text,
        Err(_) => {
            tracing::debug!("no model_folders.json sidecar at {}", sidecar.display());
            return false;
        }
    };

    let folders: ModelFolders = match serde_json::from_str(&text) {
        Ok(folders) => folders,
        Err(e) => {
            tracing::warn!("model_folders.json is unreadable: {}", e);
            return false;
        }
    };

    let enabled = folders.folders.iter().filter(|f| f.enabled).count();
    for folder in folders.folders.iter().filter(|f| f.enabled) {
        tracing::info!("self-heal candidate folder: {}", folder.path);
    }

    // The regenerator is an external collaborator; without it the sidecar
    // can only tell us that regeneration would have had something to scan.
    tracing::warn!(
        "config self-heal: {} enabled folder(s) in {}, but no auto-setup \
         collaborator is linked into this build; keeping the failing config",
        enabled,
        sidecar.display()
    );
    false
}
