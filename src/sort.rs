//! Directory listing order.

use std::cmp::Ordering;

use crate::listing::DirEntry;

/// How directory listings are ordered.
///
/// The policy space is small and closed (two switches), so this is a plain
/// `Copy` value chosen once at configuration time, not a trait object. It is
/// pure: sorting consults nothing but the entries themselves, and the same
/// input always produces the same output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortPolicy {
    /// Group directories before files, ties broken by name.
    pub directories_first: bool,
    /// Fold case when comparing names; byte-wise comparison otherwise.
    pub case_insensitive: bool,
}

impl Default for SortPolicy {
    fn default() -> Self {
        Self { directories_first: true, case_insensitive: true }
    }
}

impl SortPolicy {
    /// Sorts `entries` in place.
    ///
    /// Stable: entries whose keys compare equal (for example names differing
    /// only in case under `case_insensitive`) keep the order the filesystem
    /// enumerated them in. Re-sorting sorted input is a no-op.
    pub fn sort(&self, entries: &mut [DirEntry]) {
        entries.sort_by(|a, b| self.compare(a, b));
    }

    fn compare(&self, a: &DirEntry, b: &DirEntry) -> Ordering {
        if self.directories_first {
            match (a.is_dir, b.is_dir) {
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => {}
            }
        }
        if self.case_insensitive {
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        } else {
            a.name.as_bytes().cmp(b.name.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> DirEntry {
        DirEntry { name: name.to_string(), is_dir, size: 0, modified: None }
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn directories_group_before_files() {
        let mut entries =
            vec![entry("b.txt", false), entry("A.txt", false), entry("sub", true)];
        SortPolicy { directories_first: true, case_insensitive: true }.sort(&mut entries);
        assert_eq!(names(&entries), ["sub", "A.txt", "b.txt"]);
    }

    #[test]
    fn no_grouping_without_directories_first() {
        let mut entries =
            vec![entry("b.txt", false), entry("A.txt", false), entry("sub", true)];
        SortPolicy { directories_first: false, case_insensitive: true }.sort(&mut entries);
        assert_eq!(names(&entries), ["A.txt", "b.txt", "sub"]);
    }

    #[test]
    fn case_sensitive_compares_bytes() {
        // 'Z' (0x5a) sorts before 'a' (0x61) byte-wise.
        let mut entries = vec![entry("a.txt", false), entry("Z.txt", false)];
        SortPolicy { directories_first: false, case_insensitive: false }.sort(&mut entries);
        assert_eq!(names(&entries), ["Z.txt", "a.txt"]);

        let mut entries = vec![entry("a.txt", false), entry("Z.txt", false)];
        SortPolicy { directories_first: false, case_insensitive: true }.sort(&mut entries);
        assert_eq!(names(&entries), ["a.txt", "Z.txt"]);
    }

    #[test]
    fn case_equal_names_keep_enumeration_order() {
        let mut entries =
            vec![entry("README", false), entry("readme", false), entry("ReadMe", false)];
        SortPolicy { directories_first: false, case_insensitive: true }.sort(&mut entries);
        assert_eq!(names(&entries), ["README", "readme", "ReadMe"]);
    }

    #[test]
    fn sorting_twice_is_a_no_op() {
        let mut entries = vec![
            entry("zeta", true),
            entry("b.txt", false),
            entry("Alpha", true),
            entry("a.TXT", false),
        ];
        let policy = SortPolicy::default();
        policy.sort(&mut entries);
        let once = names(&entries).into_iter().map(String::from).collect::<Vec<_>>();
        policy.sort(&mut entries);
        assert_eq!(names(&entries), once);
    }
}
