//! Game mode providers
//!
//! The core treats games as opaque capability objects: where the data root
//! lives, how staged paths map onto it, and which file types the engine
//! dereferences or locks (and therefore must be hard-linked, never
//! symlinked).

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::link::LinkRequirement;
use crate::paths::NormalizedPath;

/// Capability object describing one managed game installation.
pub trait GameMode: Send + Sync {
    /// Stable game identifier (e.g., "skyrimse")
    fn id(&self) -> &str;

    /// Human-readable name
    fn display_name(&self) -> &str;

    /// Game installation root
    fn install_path(&self) -> &Path;

    /// Root the overlay writes into (e.g., `<install>/Data`)
    fn data_path(&self) -> &Path;

    /// Top-level folder names that mark a correctly rooted mod archive
    fn stop_folders(&self) -> &[&str];

    /// Map a staged relative path to its destination under the data root.
    /// Legacy archives ship an explicit top-level data folder; those are
    /// flattened so both layouts land in the same place.
    fn adjust_path(&self, relative: &Path) -> PathBuf {
        strip_leading_data_component(relative)
    }

    /// Which link strategies the engine tolerates for this destination
    fn link_requirement(&self, path: &NormalizedPath) -> LinkRequirement;

    /// Absolute location of a game configuration file referenced by INI
    /// edits (e.g. `Skyrim.ini`). Ledger keys are case-folded, so the real
    /// on-disk casing is resolved here.
    fn ini_path(&self, file: &str) -> PathBuf {
        let dir = self.install_path();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().eq_ignore_ascii_case(file) {
                    return entry.path();
                }
            }
        }
        dir.join(file)
    }
}

/// Supported Bethesda-engine games
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameType {
    SkyrimSE,
    SkyrimVR,
    Fallout4,
    Starfield,
}

impl GameType {
    /// Parse from stable game ID.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "skyrimse" => Some(GameType::SkyrimSE),
            "skyrimvr" => Some(GameType::SkyrimVR),
            "fallout4" => Some(GameType::Fallout4),
            "starfield" => Some(GameType::Starfield),
            _ => None,
        }
    }

    /// Get the game ID string
    pub fn id(&self) -> &'static str {
        match self {
            GameType::SkyrimSE => "skyrimse",
            GameType::SkyrimVR => "skyrimvr",
            GameType::Fallout4 => "fallout4",
            GameType::Starfield => "starfield",
        }
    }

    /// Get the display name
    pub fn display_name(&self) -> &'static str {
        match self {
            GameType::SkyrimSE => "Skyrim Special Edition",
            GameType::SkyrimVR => "Skyrim VR",
            GameType::Fallout4 => "Fallout 4",
            GameType::Starfield => "Starfield",
        }
    }
}

/// Extensions the Bethesda engine exclusively locks or dereferences at load;
/// a symlink here breaks or crashes the game, so the engine requires a hard
/// link (or a plain copy).
const HARD_LINK_EXTENSIONS: &[&str] = &["esp", "esm", "esl", "bsa", "ba2"];

const BETHESDA_STOP_FOLDERS: &[&str] = &[
    "textures",
    "meshes",
    "music",
    "sound",
    "interface",
    "scripts",
    "strings",
    "video",
    "shadersfx",
];

/// `GameMode` implementation for Bethesda titles.
#[derive(Debug, Clone)]
pub struct BethesdaGame {
    game_type: GameType,
    install_path: PathBuf,
    data_path: PathBuf,
}

impl BethesdaGame {
    pub fn new(game_type: GameType, install_path: impl Into<PathBuf>) -> Self {
        let install_path = install_path.into();
        let data_path = install_path.join("Data");
        Self {
            game_type,
            install_path,
            data_path,
        }
    }

    pub fn game_type(&self) -> GameType {
        self.game_type
    }
}

impl GameMode for BethesdaGame {
    fn id(&self) -> &str {
        self.game_type.id()
    }

    fn display_name(&self) -> &str {
        self.game_type.display_name()
    }

    fn install_path(&self) -> &Path {
        &self.install_path
    }

    fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn stop_folders(&self) -> &[&str] {
        BETHESDA_STOP_FOLDERS
    }

    fn link_requirement(&self, path: &NormalizedPath) -> LinkRequirement {
        match path.extension() {
            Some(ext) if HARD_LINK_EXTENSIONS.contains(&ext) => LinkRequirement::RequireHard,
            _ => LinkRequirement::Any,
        }
    }
}

/// Strip a leading `Data` component from a relative path (case-insensitive).
pub fn strip_leading_data_component(relative: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut skipped = false;

    for component in relative.components() {
        if !skipped {
            if let Component::Normal(part) = component {
                if part.to_string_lossy().eq_ignore_ascii_case("data") {
                    skipped = true;
                    continue;
                }
            }
            skipped = true;
        }
        out.push(component.as_os_str());
    }

    if out.as_os_str().is_empty() {
        relative.to_path_buf()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> BethesdaGame {
        BethesdaGame::new(GameType::SkyrimSE, "/games/skyrimse")
    }

    #[test]
    fn adjust_path_strips_legacy_data_prefix() {
        let g = game();
        assert_eq!(
            g.adjust_path(Path::new("Data/textures/sky.dds")),
            PathBuf::from("textures/sky.dds")
        );
        assert_eq!(
            g.adjust_path(Path::new("textures/sky.dds")),
            PathBuf::from("textures/sky.dds")
        );
    }

    #[test]
    fn plugins_and_archives_require_hard_links() {
        let g = game();
        assert_eq!(
            g.link_requirement(&NormalizedPath::new("MyMod.esp")),
            LinkRequirement::RequireHard
        );
        assert_eq!(
            g.link_requirement(&NormalizedPath::new("Textures.BSA")),
            LinkRequirement::RequireHard
        );
        assert_eq!(
            g.link_requirement(&NormalizedPath::new("textures/sky.dds")),
            LinkRequirement::Any
        );
    }

    #[test]
    fn data_path_hangs_off_install_root() {
        assert_eq!(game().data_path(), Path::new("/games/skyrimse/Data"));
    }

    #[test]
    fn ini_path_resolves_on_disk_casing() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("Skyrim.ini"), "[Display]\n").unwrap();
        let g = BethesdaGame::new(GameType::SkyrimSE, dir.path());

        assert_eq!(g.ini_path("skyrim.ini"), dir.path().join("Skyrim.ini"));
        assert_eq!(g.ini_path("other.ini"), dir.path().join("other.ini"));
    }
}
