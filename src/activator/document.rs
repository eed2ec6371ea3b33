//! `VirtualModConfig.xml` persistence (document version 0.3.0.0)
//!
//! Written under the same atomic-rename protocol as the ledger document.

use quick_xml::se::Serializer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{Overlay, VirtualLink, VirtualModInfo};
use crate::error::{Error, Result};
use crate::ledger::document::{bak_path, write_atomic};
use crate::ledger::ModKey;

pub const OVERLAY_VERSION: &str = "0.3.0.0";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "virtualModActivator")]
struct OverlayDoc {
    #[serde(rename = "@fileVersion")]
    file_version: String,
    #[serde(rename = "modList")]
    mod_list: OverlayModList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OverlayModList {
    #[serde(rename = "modInfo", default)]
    mods: Vec<ModInfoDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModInfoDoc {
    #[serde(rename = "@modKey")]
    mod_key: String,
    #[serde(rename = "@modId", default, skip_serializing_if = "Option::is_none")]
    mod_id: Option<i64>,
    #[serde(rename = "@downloadId", default, skip_serializing_if = "Option::is_none")]
    download_id: Option<i64>,
    #[serde(rename = "@modName")]
    mod_name: String,
    #[serde(rename = "@modFileName")]
    mod_file_name: String,
    #[serde(rename = "@modFilePath")]
    mod_file_path: String,
    #[serde(rename = "@FileVersion", default)]
    file_version: String,
    /// Whether the mod is enabled; a mod can be enabled yet currently lose
    /// every destination it claims, so this is not derivable from the
    /// per-link flags.
    #[serde(rename = "@modActive", default)]
    mod_active: bool,
    #[serde(rename = "fileLink", default)]
    links: Vec<FileLinkDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileLinkDoc {
    #[serde(rename = "@realPath")]
    real_path: String,
    #[serde(rename = "@virtualPath")]
    virtual_path: String,
    #[serde(rename = "linkPriority")]
    link_priority: i32,
    #[serde(rename = "isActive")]
    is_active: bool,
}

fn to_document(overlay: &Overlay) -> OverlayDoc {
    let mods = overlay
        .mods()
        .map(|(key, info)| ModInfoDoc {
            mod_key: key.to_string(),
            mod_id: info.mod_id,
            download_id: info.download_id,
            mod_name: info.mod_name.clone(),
            mod_file_name: info.mod_file_name.clone(),
            mod_file_path: info.mod_file_path.clone(),
            file_version: info.file_version.clone(),
            mod_active: crate::ledger::ActiveModSet::is_active(overlay, key),
            links: overlay
                .links_of(key)
                .into_iter()
                .map(|l| FileLinkDoc {
                    real_path: l.real_path.to_string_lossy().into_owned(),
                    virtual_path: l.virtual_path.clone(),
                    link_priority: l.priority,
                    is_active: l.active,
                })
                .collect(),
        })
        .collect();

    OverlayDoc {
        file_version: OVERLAY_VERSION.to_string(),
        mod_list: OverlayModList { mods },
    }
}

fn from_document(doc: OverlayDoc) -> Result<Overlay> {
    if doc.file_version != OVERLAY_VERSION {
        return Err(Error::LedgerIo(format!(
            "unsupported overlay version {}",
            doc.file_version
        )));
    }

    let mut overlay = Overlay::new();
    for m in doc.mod_list.mods {
        let key = ModKey::from_raw(&m.mod_key);
        overlay.upsert_mod(
            key.clone(),
            VirtualModInfo {
                mod_id: m.mod_id,
                download_id: m.download_id,
                mod_name: m.mod_name,
                mod_file_name: m.mod_file_name,
                mod_file_path: m.mod_file_path,
                file_version: m.file_version,
            },
        );
        for l in m.links {
            overlay.register_link(VirtualLink {
                mod_key: key.clone(),
                real_path: PathBuf::from(l.real_path),
                virtual_path: l.virtual_path,
                priority: l.link_priority,
                active: l.is_active,
            });
        }
        if m.mod_active {
            overlay.set_active(&key, true)?;
        }
    }
    Ok(overlay)
}

/// Serialize the overlay and write it durably.
pub async fn save(overlay: &Overlay, path: &Path) -> Result<()> {
    let doc = to_document(overlay);
    let mut body = String::new();
    let mut ser = Serializer::new(&mut body);
    ser.indent(' ', 2);
    doc.serialize(ser)
        .map_err(|e| Error::LedgerIo(format!("serialize failed: {e}")))?;

    write_atomic(path, format!("{XML_DECL}{body}").as_bytes()).await
}

/// Load the overlay, falling back to `.bak` when the primary is missing or
/// unreadable. A fresh location yields an empty overlay.
pub async fn load(path: &Path) -> Result<Overlay> {
    match read_document(path).await {
        Ok(Some(overlay)) => Ok(overlay),
        Ok(None) => match read_document(&bak_path(path)).await {
            Ok(Some(overlay)) => {
                tracing::warn!("primary overlay missing, restored from backup");
                Ok(overlay)
            }
            _ => Ok(Overlay::new()),
        },
        Err(primary_err) => match read_document(&bak_path(path)).await {
            Ok(Some(overlay)) => {
                tracing::warn!("overlay unreadable ({primary_err}), restored from backup");
                Ok(overlay)
            }
            _ => Err(primary_err),
        },
    }
}

async fn read_document(path: &Path) -> Result<Option<Overlay>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::LedgerIo(format!("read {} failed: {e}", path.display()))),
    };
    let doc: OverlayDoc = quick_xml::de::from_str(&content)
        .map_err(|e| Error::LedgerIo(format!("parse {} failed: {e}", path.display())))?;
    from_document(doc).map(Some)
}
