mod hash;
mod snapshot;

pub use hash::SnapshotHash;
pub use snapshot::{
    is_allowed_extension, parse_snapshot_file_name, SnapshotFile, SnapshotInfo, SnapshotSource,
    ALLOWED_EXTENSIONS,
};
