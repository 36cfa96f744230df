//! File-backed snapshot persistence.

use crate::agent::AgentSnapshot;
use crate::collaborators::Snapshotter;
use ron::ser::PrettyConfig;
use std::fs;
use std::path::PathBuf;

/// Persists agent snapshots to a single RON file, overwriting on every
/// update.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store writing to `path`. Parent directories are created if
    /// missing.
    pub fn new(path: PathBuf) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the last written snapshot.
    pub fn load(&self) -> Result<AgentSnapshot, anyhow::Error> {
        let val = fs::read_to_string(&self.path)?;
        Ok(ron::de::from_str(&val)?)
    }
}

impl Snapshotter for FileStore {
    fn snapshot(&mut self, snapshot: &AgentSnapshot) -> Result<(), anyhow::Error> {
        let val = ron::ser::to_string_pretty(snapshot, PrettyConfig::default())?;
        fs::write(&self.path, &val)?;
        Ok(())
    }
}
