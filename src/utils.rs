//! Small, pure or near-pure helpers shared across modules: filename sanitization and
//! filesystem usage.
//!
//! Trimmed from the teacher's broader grab-bag of generic pooling/rate-limiting/formatting
//! helpers (`BufferPool`, `MemoryMonitor`, `RateLimiter`, `ConnectionPool`, `RequestInterceptor`,
//! and its byte/duration/URL formatting trio), none of which this service ended up needing:
//! resource blocking lives in `adapters::scrape`'s own narrower `should_block_resource`, and
//! nothing else pools buffers or connections generically or needs to print a size/duration back
//! to an operator.

use std::path::Path;

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Fraction of the filesystem backing `path` currently in use, in `[0.0, 1.0]`. Walks up from
/// `path` to find the disk whose mount point is the longest matching prefix, the same approach
/// `df` uses. Used by the garbage collector's disk-pressure sweep and by the health reporter;
/// returns `0.0` if no disk's mount point matches (e.g. in a container with a virtualized root),
/// which is treated as "not under pressure" rather than an error.
pub fn disk_usage_fraction(path: &Path) -> f64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    let mut best: Option<(&std::path::Path, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if canonical.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(m, _, _)| m.components().count() < depth).unwrap_or(true) {
                best = Some((mount, disk.total_space(), disk.available_space()));
            }
        }
    }

    match best {
        Some((_, total, available)) if total > 0 => 1.0 - (available as f64 / total as f64),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
    }

    #[test]
    fn disk_usage_fraction_is_within_unit_range() {
        let frac = disk_usage_fraction(Path::new("/tmp"));
        assert!((0.0..=1.0).contains(&frac));
    }
}
