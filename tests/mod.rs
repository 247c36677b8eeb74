//! Main test module for backstep
//!
//! This module includes all test suites:
//! - Integration tests for multi-session histories
//! - Chaos tests for interrupted sessions and damaged destinations
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::integration::{capture_state, BackstepTestHarness};
    use ::backstep::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory() {
        let mut harness = BackstepTestHarness::new();
        let report = harness.backup();
        assert_eq!(report.stats.source_entries, 1);

        harness.write_file("file.txt", b"content");
        harness.backup();

        // The first session only had the root
        let records: Vec<Record> = harness
            .backstep
            .read_tree_at(harness.history[0].0)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].index.is_root());
        harness.assert_restores_history();
    }

    #[test]
    fn test_special_filenames() {
        let mut harness = BackstepTestHarness::new();
        let special_names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "file\\with\\backslashes",
            "file\nwith\nnewlines",
            "File with a header lookalike",
            "trailing space ",
        ];
        for name in &special_names {
            harness.write_file(name, format!("Content of {}", name).as_bytes());
        }
        harness.backup();
        for name in &special_names {
            harness.write_file(name, format!("Changed content of {}", name).as_bytes());
        }
        harness.backup();
        harness.assert_restores_history();
    }

    #[test]
    fn test_unicode_filenames() {
        let mut harness = BackstepTestHarness::new();
        let unicode_names = [
            "файл.txt",
            "文件.txt",
            "ファイル.txt",
            "파일.txt",
            "αρχείο.txt",
            "ملف.txt",
            "קובץ.txt",
            "🚀🌟💾.txt",
        ];
        for name in &unicode_names {
            harness.write_file(&format!("ünïcødé/{}", name), name.as_bytes());
        }
        harness.backup();
        harness.remove("ünïcødé/文件.txt");
        harness.backup();
        harness.assert_restores_history();
    }

    #[test]
    fn test_non_utf8_filename() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut harness = BackstepTestHarness::new();
        let name = OsStr::from_bytes(b"latin1-\xe9t\xe9");
        if fs::write(harness.source().join(name), b"bytes").is_err() {
            // Some filesystems insist on UTF-8
            return;
        }
        harness.backup();
        fs::remove_file(harness.source().join(name)).unwrap();
        harness.backup();

        let scratch = TempDir::new().unwrap();
        let target = scratch.path().join("out");
        harness.backstep.restore(harness.history[0].0, &target).unwrap();
        assert_eq!(fs::read(target.join(name)).unwrap(), b"bytes");
    }

    #[test]
    fn test_permissions_survive_history() {
        let mut harness = BackstepTestHarness::new();
        harness.write_file("script.sh", b"#!/bin/sh\necho hi\n");
        fs::set_permissions(harness.source().join("script.sh"), fs::Permissions::from_mode(0o750)).unwrap();
        harness.backup();

        fs::set_permissions(harness.source().join("script.sh"), fs::Permissions::from_mode(0o600)).unwrap();
        let report = harness.backup();
        assert_eq!(report.stats.changed_entries, 1);

        let scratch = TempDir::new().unwrap();
        let old = scratch.path().join("old");
        harness.backstep.restore(harness.history[0].0, &old).unwrap();
        let mode = fs::metadata(old.join("script.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);
        let mirror_mode = fs::metadata(harness.dest().join("script.sh")).unwrap().permissions().mode();
        assert_eq!(mirror_mode & 0o7777, 0o600);
    }

    #[test]
    fn test_symlinks() {
        let mut harness = BackstepTestHarness::new();
        harness.write_file("target.txt", b"Target content");
        std::os::unix::fs::symlink("target.txt", harness.source().join("link.txt")).unwrap();
        std::os::unix::fs::symlink("/nowhere/at/all", harness.source().join("dangling")).unwrap();
        harness.backup();

        // Link retargeted, then replaced by a regular file
        harness.remove("link.txt");
        std::os::unix::fs::symlink("elsewhere.txt", harness.source().join("link.txt")).unwrap();
        harness.backup();
        harness.remove("link.txt");
        harness.write_file("link.txt", b"no longer a link");
        harness.backup();

        harness.assert_restores_history();
        let mirror = capture_state(harness.dest());
        assert_eq!(mirror, harness.history[2].1);
    }

    #[test]
    fn test_unchanged_session_writes_no_increments() {
        let mut harness = BackstepTestHarness::new();
        harness.write_file("a/b/c.txt", b"stable");
        harness.write_file("d.txt", b"also stable");
        harness.backup();
        let report = harness.backup();
        assert!(!report.stats.has_changes());
        assert_eq!(report.stats.increment_files, 0);
        assert!(harness.backstep.layout().all_increments().unwrap().is_empty());
    }

    #[test]
    fn test_persisted_separator_shapes_file_names() {
        let mut harness = BackstepTestHarness::with_builder(BackstepBuilder::new().timestamp_separator(';'));
        harness.write_file("file", b"one");
        harness.backup();
        harness.write_file("file", b"two");
        harness.backup();

        let increments = harness.backstep.layout().all_increments().unwrap();
        assert_eq!(increments.len(), 1);
        let name = increments[0].path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains(';') && !name.contains(':'), "{}", name);

        let reopened = Backstep::open(harness.dest()).unwrap();
        assert_eq!(reopened.config().timestamp_separator, ';');
        assert_eq!(reopened.list_sessions().unwrap().len(), 2);
    }
}
