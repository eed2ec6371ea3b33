//! `InstallLog.xml` persistence (document version 0.5.0.0)
//!
//! Serde model of the interchange document plus the durable write protocol
//! shared with the overlay document: serialize to a sibling `.tmp`, fsync,
//! rename the previous primary to `.bak`, then atomically rename the `.tmp`
//! over the primary.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use quick_xml::se::Serializer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{IniKey, InstallLog, InstallerStack, ModEntry, ModKey, ORIGINAL_VALUES};
use crate::error::{Error, Result};
use crate::paths::NormalizedPath;

pub const INSTALL_LOG_VERSION: &str = "0.5.0.0";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "installLog")]
struct InstallLogDoc {
    #[serde(rename = "@fileVersion")]
    file_version: String,
    #[serde(rename = "modList")]
    mod_list: ModListDoc,
    #[serde(rename = "dataFiles")]
    data_files: DataFilesDoc,
    #[serde(rename = "iniEdits")]
    ini_edits: IniEditsDoc,
    #[serde(rename = "gameSpecificEdits")]
    game_edits: GameEditsDoc,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModListDoc {
    /// Monotonic key counter; persisted so keys are never reused after a
    /// mod is removed.
    #[serde(rename = "@keyCounter", default)]
    key_counter: u64,
    #[serde(rename = "mod", default)]
    mods: Vec<ModDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModDoc {
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "@key")]
    key: String,
    version: VersionDoc,
    name: String,
    #[serde(rename = "installDate")]
    install_date: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionDoc {
    #[serde(rename = "@machineVersion", default)]
    machine_version: String,
    #[serde(rename = "$text", default)]
    human_version: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataFilesDoc {
    #[serde(rename = "file", default)]
    files: Vec<FileDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDoc {
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "installingMods")]
    installing_mods: InstallingMods,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstallingMods {
    #[serde(rename = "mod", default)]
    mods: Vec<InstallerRef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstallerRef {
    #[serde(rename = "@key")]
    key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IniEditsDoc {
    #[serde(rename = "ini", default)]
    edits: Vec<IniDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IniDoc {
    #[serde(rename = "@file")]
    file: String,
    #[serde(rename = "@section")]
    section: String,
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "installingMods")]
    installing_mods: InstallingValues,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstallingValues {
    #[serde(rename = "mod", default)]
    mods: Vec<ValueRef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ValueRef {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GameEditsDoc {
    #[serde(rename = "edit", default)]
    edits: Vec<GameEditDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GameEditDoc {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "installingMods")]
    installing_mods: InstallingValues,
}

// ========== Model conversion ==========

fn to_document(log: &InstallLog) -> InstallLogDoc {
    // The pseudo-mod heads the list so readers resolve the reserved key
    // before any stack references it.
    let mut mods = vec![ModDoc {
        path: ORIGINAL_VALUES.to_string(),
        key: ORIGINAL_VALUES.to_string(),
        version: VersionDoc {
            machine_version: "0.0.0.0".to_string(),
            human_version: "0".to_string(),
        },
        name: "Original Values".to_string(),
        install_date: DateTime::<Utc>::UNIX_EPOCH.to_rfc3339(),
    }];
    mods.extend(log.mods().map(|m| ModDoc {
        path: m.archive_path.clone(),
        key: m.key.to_string(),
        version: VersionDoc {
            machine_version: m
                .machine_version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            human_version: m.human_version.clone(),
        },
        name: m.display_name.clone(),
        install_date: m.install_date.to_rfc3339(),
    }));

    let files = log
        .files_map()
        .iter()
        .map(|(path, stack)| FileDoc {
            path: path.to_string(),
            installing_mods: InstallingMods {
                mods: stack
                    .keys()
                    .map(|k| InstallerRef { key: k.to_string() })
                    .collect(),
            },
        })
        .collect();

    let ini_edits = log
        .ini_map()
        .iter()
        .map(|(key, stack)| IniDoc {
            file: key.file.clone(),
            section: key.section.clone(),
            key: key.key.clone(),
            installing_mods: InstallingValues {
                mods: stack
                    .entries()
                    .map(|(k, v)| ValueRef {
                        key: k.to_string(),
                        value: v.clone(),
                    })
                    .collect(),
            },
        })
        .collect();

    let game_edits = log
        .game_values_map()
        .iter()
        .map(|(name, stack)| GameEditDoc {
            key: name.clone(),
            installing_mods: InstallingValues {
                mods: stack
                    .entries()
                    .map(|(k, v)| ValueRef {
                        key: k.to_string(),
                        value: BASE64.encode(v),
                    })
                    .collect(),
            },
        })
        .collect();

    InstallLogDoc {
        file_version: INSTALL_LOG_VERSION.to_string(),
        mod_list: ModListDoc {
            key_counter: log.key_counter(),
            mods,
        },
        data_files: DataFilesDoc { files },
        ini_edits: IniEditsDoc { edits: ini_edits },
        game_edits: GameEditsDoc { edits: game_edits },
    }
}

fn from_document(doc: InstallLogDoc) -> Result<InstallLog> {
    if doc.file_version != INSTALL_LOG_VERSION {
        return Err(Error::LedgerIo(format!(
            "unsupported install log version {}",
            doc.file_version
        )));
    }

    let mut log = InstallLog::new();
    log.set_key_counter(doc.mod_list.key_counter);

    for m in doc.mod_list.mods {
        if m.key == ORIGINAL_VALUES {
            continue;
        }
        let install_date = DateTime::parse_from_rfc3339(&m.install_date)
            .map_err(|e| Error::LedgerIo(format!("bad install date for {}: {e}", m.key)))?
            .with_timezone(&Utc);
        log.insert_mod_entry(ModEntry {
            key: ModKey::from_raw(&m.key),
            archive_path: m.path,
            display_name: m.name,
            human_version: m.version.human_version,
            machine_version: semver::Version::parse(&m.version.machine_version).ok(),
            install_date,
        });
    }

    for f in doc.data_files.files {
        let mut stack = InstallerStack::new();
        for installer in f.installing_mods.mods {
            stack.push(ModKey::from_raw(installer.key), ());
        }
        if !stack.is_empty() {
            log.insert_file_stack(NormalizedPath::from_normalized(f.path), stack);
        }
    }

    for i in doc.ini_edits.edits {
        let mut stack = InstallerStack::new();
        for installer in i.installing_mods.mods {
            stack.push(ModKey::from_raw(installer.key), installer.value);
        }
        if !stack.is_empty() {
            log.insert_ini_stack(IniKey::new(&i.file, &i.section, &i.key), stack);
        }
    }

    for g in doc.game_edits.edits {
        let mut stack = InstallerStack::new();
        for installer in g.installing_mods.mods {
            let bytes = BASE64
                .decode(installer.value.as_bytes())
                .map_err(|e| Error::LedgerIo(format!("bad game value for {}: {e}", g.key)))?;
            stack.push(ModKey::from_raw(installer.key), bytes);
        }
        if !stack.is_empty() {
            log.insert_game_value_stack(g.key, stack);
        }
    }

    log.validate()?;
    Ok(log)
}

// ========== Durable I/O ==========

/// Serialize the ledger and write it under the atomic-rename protocol.
pub async fn save(log: &InstallLog, path: &Path) -> Result<()> {
    let doc = to_document(log);
    let mut body = String::new();
    let mut ser = Serializer::new(&mut body);
    ser.indent(' ', 2);
    doc.serialize(ser)
        .map_err(|e| Error::LedgerIo(format!("serialize failed: {e}")))?;

    write_atomic(path, format!("{XML_DECL}{body}").as_bytes()).await
}

/// Load the ledger, falling back to the `.bak` sibling when the primary is
/// missing or unreadable. A completely fresh location yields an empty log.
pub async fn load(path: &Path) -> Result<InstallLog> {
    match read_document(path).await {
        Ok(Some(log)) => Ok(log),
        Ok(None) => {
            let backup = bak_path(path);
            match read_document(&backup).await {
                Ok(Some(log)) => {
                    tracing::warn!("primary ledger missing, restored from {}", backup.display());
                    Ok(log)
                }
                _ => Ok(InstallLog::new()),
            }
        }
        Err(primary_err) => {
            let backup = bak_path(path);
            match read_document(&backup).await {
                Ok(Some(log)) => {
                    tracing::warn!(
                        "ledger unreadable ({primary_err}), restored from {}",
                        backup.display()
                    );
                    Ok(log)
                }
                _ => Err(primary_err),
            }
        }
    }
}

async fn read_document(path: &Path) -> Result<Option<InstallLog>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::LedgerIo(format!("read {} failed: {e}", path.display()))),
    };
    let doc: InstallLogDoc = quick_xml::de::from_str(&content)
        .map_err(|e| Error::LedgerIo(format!("parse {} failed: {e}", path.display())))?;
    from_document(doc).map(Some)
}

/// Write `contents` to `path` durably: `.tmp` sibling, fsync, `.bak`
/// rotation of the previous primary, atomic rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = sibling(path, "tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| Error::LedgerIo(format!("create {} failed: {e}", tmp.display())))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::LedgerIo(format!("write {} failed: {e}", tmp.display())))?;
    file.sync_all()
        .await
        .map_err(|e| Error::LedgerIo(format!("fsync {} failed: {e}", tmp.display())))?;
    drop(file);

    if fs::try_exists(path).await.unwrap_or(false) {
        fs::rename(path, bak_path(path))
            .await
            .map_err(|e| Error::LedgerIo(format!("backup rotation failed: {e}")))?;
    }
    fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::LedgerIo(format!("rename over {} failed: {e}", path.display())))?;
    Ok(())
}

fn sibling(path: &Path, ext: &str) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

pub(crate) fn bak_path(path: &Path) -> std::path::PathBuf {
    sibling(path, "bak")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ModInfo;
    use tempfile::TempDir;

    fn populated_log() -> InstallLog {
        let mut log = InstallLog::new();
        let a = log
            .activate_mod(ModInfo {
                archive_path: "mods/better-skies.7z".into(),
                display_name: "Better Skies".into(),
                human_version: "1.2".into(),
                machine_version: semver::Version::parse("1.2.0").ok(),
            })
            .unwrap();
        let b = log
            .activate_mod(ModInfo {
                archive_path: "mods/night-eyes.zip".into(),
                display_name: "Night Eyes".into(),
                human_version: "0.9".into(),
                machine_version: None,
            })
            .unwrap();

        let p = NormalizedPath::new("Data/textures/sky.dds");
        log.add_file(&a, &p, true).unwrap();
        log.add_file(&b, &p, false).unwrap();
        log.add_file(&b, &NormalizedPath::new("Data/night.esp"), false)
            .unwrap();

        log.add_ini_edit(
            &a,
            &IniKey::new("Skyrim.ini", "Display", "fShadowDistance"),
            "8000".into(),
            Some("3000".into()),
        )
        .unwrap();
        log.add_game_value(&a, "archive-order", vec![0xde, 0xad], Some(vec![0x00]))
            .unwrap();
        log
    }

    #[tokio::test]
    async fn save_load_round_trips_the_ledger() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("InstallLog.xml");
        let log = populated_log();

        save(&log, &path).await.unwrap();
        let loaded = load(&path).await.unwrap();

        let p = NormalizedPath::new("data/textures/sky.dds");
        assert_eq!(loaded.installers_of(&p), log.installers_of(&p));
        assert_eq!(loaded.key_counter(), log.key_counter());
        assert_eq!(
            loaded.current_ini_value(&IniKey::new("Skyrim.ini", "Display", "fShadowDistance")),
            Some("8000")
        );
        assert_eq!(loaded.current_game_value("archive-order"), Some(&[0xde, 0xad][..]));
        assert_eq!(loaded.mods().count(), log.mods().count());
        loaded.validate().unwrap();
    }

    #[tokio::test]
    async fn document_puts_the_pseudo_mod_first() {
        let doc = to_document(&populated_log());
        assert_eq!(doc.mod_list.mods[0].key, ORIGINAL_VALUES);
        assert_eq!(doc.file_version, INSTALL_LOG_VERSION);
    }

    #[tokio::test]
    async fn installer_order_is_preserved_on_disk() {
        let doc = to_document(&populated_log());
        let sky = doc
            .data_files
            .files
            .iter()
            .find(|f| f.path == "data/textures/sky.dds")
            .unwrap();
        let keys: Vec<_> = sky.installing_mods.mods.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys[0], ORIGINAL_VALUES);
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn rewrite_rotates_the_previous_primary_to_bak() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("InstallLog.xml");
        let log = populated_log();

        save(&log, &path).await.unwrap();
        save(&log, &path).await.unwrap();
        assert!(bak_path(&path).exists());
        assert!(!sibling(&path, "tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_bak() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("InstallLog.xml");
        let log = populated_log();

        save(&log, &path).await.unwrap();
        save(&log, &path).await.unwrap();
        tokio::fs::write(&path, b"<notxml").await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.mods().count(), log.mods().count());
    }

    #[tokio::test]
    async fn fresh_location_loads_an_empty_ledger() {
        let dir = TempDir::new().unwrap();
        let loaded = load(&dir.path().join("InstallLog.xml")).await.unwrap();
        assert_eq!(loaded.mods().count(), 0);
    }
}
