//! Maps the game directory to the archives kept on Drive.

use std::fmt;
use std::path::{Path, PathBuf};

/// Archive name of the mods directory
pub const MODS_ARCHIVE: &str = "mods.zip";

/// A logical unit synchronized as one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncUnit {
    Saves,
    Mods,
}

impl SyncUnit {
    pub const ALL: [SyncUnit; 2] = [SyncUnit::Saves, SyncUnit::Mods];

    pub fn label(&self) -> &'static str {
        match self {
            SyncUnit::Saves => "saves",
            SyncUnit::Mods => "mods",
        }
    }
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolved directories of one game installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameLayout {
    game_dir: PathBuf,
    save_folder: String,
}

impl GameLayout {
    pub fn new(game_dir: impl Into<PathBuf>, save_folder: impl Into<String>) -> Self {
        Self {
            game_dir: game_dir.into(),
            save_folder: save_folder.into(),
        }
    }

    pub fn game_dir(&self) -> &Path {
        &self.game_dir
    }

    pub fn save_folder(&self) -> &str {
        &self.save_folder
    }

    /// `<game>/saves`
    pub fn saves_root(&self) -> PathBuf {
        self.game_dir.join("saves")
    }

    /// `<game>/mods`
    pub fn mods_dir(&self) -> PathBuf {
        self.game_dir.join("mods")
    }

    /// Directory that gets zipped for `unit`.
    pub fn local_dir(&self, unit: SyncUnit) -> PathBuf {
        match unit {
            SyncUnit::Saves => self.saves_root().join(&self.save_folder),
            SyncUnit::Mods => self.mods_dir(),
        }
    }

    /// Directory a downloaded archive of `unit` is extracted into.
    ///
    /// Archive entries are relative to the zipped directory, so this is the
    /// same directory the archive was made from.
    pub fn extract_dir(&self, unit: SyncUnit) -> PathBuf {
        self.local_dir(unit)
    }

    pub fn archive_name(&self, unit: SyncUnit) -> String {
        match unit {
            SyncUnit::Saves => format!("{}.zip", self.save_folder),
            SyncUnit::Mods => MODS_ARCHIVE.to_string(),
        }
    }

    /// File names skipped at any depth when zipping `unit`.
    pub fn excludes(&self, unit: SyncUnit) -> Vec<String> {
        match unit {
            SyncUnit::Saves => Vec::new(),
            SyncUnit::Mods => vec![MODS_ARCHIVE.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = GameLayout::new("/games/mc", "world1");
        assert_eq!(
            layout.local_dir(SyncUnit::Saves),
            PathBuf::from("/games/mc/saves/world1")
        );
        assert_eq!(layout.local_dir(SyncUnit::Mods), PathBuf::from("/games/mc/mods"));
        assert_eq!(layout.archive_name(SyncUnit::Saves), "world1.zip");
        assert_eq!(layout.archive_name(SyncUnit::Mods), "mods.zip");
        assert_eq!(layout.excludes(SyncUnit::Mods), vec!["mods.zip".to_string()]);
        assert!(layout.excludes(SyncUnit::Saves).is_empty());
    }
}
