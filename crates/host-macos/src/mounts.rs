/// Whole-disk identifier for a device node: `/dev/disk3s1s1` -> `disk3`.
pub fn whole_disk_of(device: &str) -> Option<String> {
    let name = device.rsplit('/').next()?;
    let digits = name.strip_prefix("disk")?;
    let number: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    if number.is_empty() {
        return None;
    }
    Some(format!("disk{number}"))
}

/// Whole disk behind the `/` entry of a `(device, mount point)` table.
/// Entries not backed by a `diskN` node, such as an automounter map, never match.
pub fn root_disk_in<'a>(mut table: impl Iterator<Item = (&'a str, &'a str)>) -> Option<String> {
    table.find_map(|(device, mount_point)| {
        if mount_point == "/" {
            whole_disk_of(device)
        } else {
            None
        }
    })
}

/// Fallback boot-disk lookup from the mount table, used when `diskutil info /`
/// is unavailable.
#[cfg(target_os = "macos")]
pub fn root_whole_disk() -> Option<String> {
    let table = statfs_table()?;
    root_disk_in(
        table
            .iter()
            .map(|entry| (c_field(&entry.f_mntfromname), c_field(&entry.f_mntonname))),
    )
}

#[cfg(not(target_os = "macos"))]
pub fn root_whole_disk() -> Option<String> {
    None
}

#[cfg(target_os = "macos")]
fn statfs_table() -> Option<Vec<libc::statfs>> {
    use std::{mem, ptr};

    // SAFETY: a null buffer only asks for the entry count.
    let count = unsafe { libc::getfsstat(ptr::null_mut(), 0, libc::MNT_NOWAIT) };
    let count = usize::try_from(count).ok().filter(|&n| n > 0)?;
    // SAFETY: statfs is plain old data.
    let mut table = vec![unsafe { mem::zeroed::<libc::statfs>() }; count];
    let bytes = libc::c_int::try_from(table.len() * mem::size_of::<libc::statfs>()).ok()?;
    // SAFETY: `bytes` is the exact size of `table`.
    let filled = unsafe { libc::getfsstat(table.as_mut_ptr(), bytes, libc::MNT_NOWAIT) };
    table.truncate(usize::try_from(filled).ok()?);
    Some(table)
}

#[cfg(target_os = "macos")]
fn c_field(field: &[libc::c_char]) -> &str {
    // SAFETY: the kernel NUL-terminates every statfs name field.
    unsafe { std::ffi::CStr::from_ptr(field.as_ptr()) }
        .to_str()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_slices_and_dev_prefix() {
        assert_eq!(whole_disk_of("/dev/disk3s1s1"), Some("disk3".to_string()));
        assert_eq!(whole_disk_of("disk12s4"), Some("disk12".to_string()));
        assert_eq!(whole_disk_of("/dev/disk0"), Some("disk0".to_string()));
        assert_eq!(whole_disk_of("map auto_home"), None);
        assert_eq!(whole_disk_of("/dev/disk"), None);
    }

    #[test]
    fn root_entry_picks_the_boot_disk() {
        let table = [
            ("devfs", "/dev"),
            ("/dev/disk3s5", "/System/Volumes/Data"),
            ("/dev/disk3s1s1", "/"),
            ("/dev/disk4s2", "/Volumes/USB"),
        ];
        assert_eq!(root_disk_in(table.into_iter()), Some("disk3".to_string()));
        assert_eq!(root_disk_in([("map auto_home", "/")].into_iter()), None);
        assert_eq!(root_disk_in(std::iter::empty()), None);
    }
}
