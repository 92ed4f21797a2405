// Free-space lookup for the volume holding a path

use crate::reparse::absolute;
use std::path::Path;
use sysinfo::Disks;

/// Bytes available to the current user on the volume containing `path`.
///
/// Picks the disk with the longest mount point that prefixes `path`.
/// Returns None when no disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = absolute(path);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
