//! Point-in-time copies of the data store, critical paths, config files and
//! application roots, kept under `<state>/backups/<id>/`.

mod manifest;
mod store;

pub use manifest::{
    read_manifest, write_manifest, EntryKind, ManifestEntry, ManifestFile, SnapshotManifest,
    MANIFEST_FILE, MANIFEST_FORMAT,
};
pub use store::{new_snapshot_id, RestoreReport, SnapshotSource, SnapshotStore, SnapshotSummary};

#[cfg(test)]
mod tests;
