// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory enumeration through small, fixed output buffers

use std::collections::BTreeSet;
use std::fs;

use reefs_daemon::{ConfinedRoot, FsAdapter, ReaddirOutcome, ReefsError};
use reefs_proto::messages::dirent_record_len;
use reefs_proto::{DIRENT_ALIGN, DirentIter};

fn populated_root(count: usize) -> (tempfile::TempDir, BTreeSet<String>) {
    let dir = tempfile::tempdir().unwrap();
    let mut names = BTreeSet::new();
    for i in 0..count {
        // varying lengths exercise the padding
        let name = format!("{}{}", "f".repeat(i % 13 + 1), i);
        fs::write(dir.path().join(&name), b"").unwrap();
        names.insert(name);
    }
    fs::create_dir(dir.path().join("subdir")).unwrap();
    names.insert("subdir".to_string());
    (dir, names)
}

/// Enumerate the whole root with `buf_size`-byte requests
fn enumerate(adapter: &mut FsAdapter, buf_size: usize) -> Vec<String> {
    let handle = adapter.opendir(b"/").unwrap();
    let mut buf = vec![0u8; buf_size];
    let mut seen = Vec::new();
    loop {
        match adapter.readdir(handle, &mut buf).unwrap() {
            ReaddirOutcome::Packed(len) => {
                assert!(len <= buf_size);
                let mut walked = 0;
                for entry in DirentIter::new(&buf[..len]) {
                    let entry = entry.unwrap();
                    assert_eq!(entry.reclen % DIRENT_ALIGN, 0);
                    walked += entry.reclen;
                    seen.push(String::from_utf8(entry.name.to_vec()).unwrap());
                }
                assert_eq!(walked, len);
            }
            ReaddirOutcome::EndOfDirectory => break,
        }
    }
    adapter.closedir(handle).unwrap();
    seen
}

#[test]
fn every_entry_is_listed_once_for_any_buffer_size() {
    let (dir, expected) = populated_root(40);
    let mut adapter = FsAdapter::new(ConfinedRoot::new(dir.path()));
    let largest = expected
        .iter()
        .map(|name| dirent_record_len(name.len()))
        .max()
        .unwrap();

    for buf_size in [largest, largest + 1, largest + DIRENT_ALIGN, 97, 256, 4096] {
        if buf_size < largest {
            continue;
        }
        let seen = enumerate(&mut adapter, buf_size);
        let unique: BTreeSet<String> = seen.iter().cloned().collect();

        assert_eq!(seen.len(), expected.len(), "buffer size {}", buf_size);
        assert_eq!(unique, expected, "buffer size {}", buf_size);
        assert!(!unique.contains(".") && !unique.contains(".."));
    }
}

#[test]
fn order_matches_a_single_large_read() {
    let (dir, _) = populated_root(25);
    let mut adapter = FsAdapter::new(ConfinedRoot::new(dir.path()));

    let reference = enumerate(&mut adapter, 64 * 1024);
    let chunked = enumerate(&mut adapter, dirent_record_len(20));
    assert_eq!(chunked, reference);
}

#[test]
fn undersized_buffer_reports_overflow_without_advancing() {
    let (dir, expected) = populated_root(3);
    let mut adapter = FsAdapter::new(ConfinedRoot::new(dir.path()));
    let handle = adapter.opendir(b"/").unwrap();

    let mut tiny = [0u8; 16];
    for _ in 0..3 {
        let err = adapter.readdir(handle, &mut tiny).unwrap_err();
        assert!(matches!(err, ReefsError::EntryTooLarge));
        assert_eq!(err.errno(), libc::E2BIG);
    }

    let mut buf = vec![0u8; 4096];
    let ReaddirOutcome::Packed(len) = adapter.readdir(handle, &mut buf).unwrap() else {
        panic!("expected entries after overflow");
    };
    assert_eq!(DirentIter::new(&buf[..len]).count(), expected.len());
}

#[test]
fn empty_directory_ends_immediately() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("empty")).unwrap();
    let mut adapter = FsAdapter::new(ConfinedRoot::new(dir.path()));

    let handle = adapter.opendir(b"/empty").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(
        adapter.readdir(handle, &mut buf).unwrap(),
        ReaddirOutcome::EndOfDirectory
    );
}
