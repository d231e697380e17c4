#[cfg(test)]
mod tests {
    use libc::{EBADF, EEXIST, ENOENT, ENOSYS, ENOTEMPTY};
    use tempfile::TempDir;

    use crate::common::FileMode;
    use crate::fs::LedgerFs;
    use crate::inode::Inode;
    use crate::store::{StoreError, StoreGateway};
    use crate::ROOT_INUMBER;

    fn mount() -> (TempDir, LedgerFs, StoreGateway) {
        let dir = TempDir::new().unwrap();
        let store = StoreGateway::open(&dir.path().join("store.db")).unwrap();
        let fs = LedgerFs::new(store.clone(), 1000, 1000).unwrap();
        (dir, fs, store)
    }

    #[test]
    fn fresh_mount_creates_root() {
        let (_t, _fs, store) = mount();
        let root = Inode::load(&store, ROOT_INUMBER).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.mode().perm(), 0o700);
        assert_eq!((root.uid, root.gid), (1000, 1000));
    }

    #[test]
    fn remount_keeps_the_existing_root() {
        let (_t, _fs, store) = mount();
        let fs2 = LedgerFs::new(store.clone(), 42, 42).unwrap();
        drop(fs2);
        let root = Inode::load(&store, ROOT_INUMBER).unwrap();
        assert_eq!((root.uid, root.gid), (1000, 1000));
    }

    #[test]
    fn create_write_read() {
        let (_t, fs, _store) = mount();
        let d = fs
            .make_node(ROOT_INUMBER, b"d", FileMode::dir(0o755))
            .unwrap();
        assert_eq!(d.ino, 2);
        let f = fs.make_node(d.ino, b"f", FileMode::file(0o644)).unwrap();
        assert_eq!(f.ino, 3);

        assert_eq!(fs.do_write(f.ino, 0, b"hello").unwrap(), 5);
        assert_eq!(fs.do_read(f.ino, 0, 5).unwrap(), b"hello");
        assert_eq!(fs.do_getattr(f.ino).unwrap().size, 5);
    }

    #[test]
    fn append_past_end_zero_fills() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_write(f.ino, 0, b"hello").unwrap();
        fs.do_write(f.ino, 10, b"!").unwrap();

        assert_eq!(fs.do_getattr(f.ino).unwrap().size, 11);
        assert_eq!(fs.do_read(f.ino, 0, 11).unwrap(), b"hello\0\0\0\0\0!");
    }

    #[test]
    fn reads_past_the_end_are_short() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_write(f.ino, 0, b"abc").unwrap();
        assert_eq!(fs.do_read(f.ino, 0, 10).unwrap(), b"abc");
        assert_eq!(fs.do_read(f.ino, 50, 10).unwrap(), b"");
    }

    #[test]
    fn truncate_needs_a_file_handle() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_write(f.ino, 0, b"hello").unwrap();

        assert_eq!(
            fs.do_setattr(f.ino, Some(3), None, None, None).unwrap_err(),
            EBADF
        );
        let attr = fs.do_setattr(f.ino, Some(3), None, None, Some(0)).unwrap();
        assert_eq!(attr.size, 3);
        assert_eq!(fs.do_read(f.ino, 0, 10).unwrap(), b"hel");

        // open(O_TRUNC) arrives without a handle and truncates to zero.
        let attr = fs.do_setattr(f.ino, Some(0), None, None, None).unwrap();
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn create_collision_is_eexist() {
        let (_t, fs, _store) = mount();
        fs.make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        assert_eq!(
            fs.make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
                .unwrap_err(),
            EEXIST
        );
    }

    #[test]
    fn lookup_missing_name_is_enoent() {
        let (_t, fs, _store) = mount();
        assert_eq!(fs.do_lookup(ROOT_INUMBER, b"nope").unwrap_err(), ENOENT);
    }

    #[test]
    fn lookup_does_not_touch_persistent_nlink() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        for _ in 0..3 {
            fs.do_lookup(ROOT_INUMBER, b"f").unwrap();
        }
        assert_eq!(fs.do_getattr(f.ino).unwrap().nlink, 1);
    }

    #[test]
    fn rmdir_refuses_a_non_empty_directory() {
        let (_t, fs, _store) = mount();
        let e = fs
            .make_node(ROOT_INUMBER, b"e", FileMode::dir(0o755))
            .unwrap();
        fs.make_node(e.ino, b"x", FileMode::file(0o644)).unwrap();

        assert_eq!(fs.do_rmdir(ROOT_INUMBER, b"e").unwrap_err(), ENOTEMPTY);

        fs.do_unlink(e.ino, b"x").unwrap();
        fs.do_rmdir(ROOT_INUMBER, b"e").unwrap();
        assert_eq!(fs.do_lookup(ROOT_INUMBER, b"e").unwrap_err(), ENOENT);
    }

    #[test]
    fn unlinked_inode_lives_until_forgotten() {
        let (_t, fs, store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_write(f.ino, 0, b"data").unwrap();
        fs.do_lookup(ROOT_INUMBER, b"f").unwrap();

        fs.do_unlink(ROOT_INUMBER, b"f").unwrap();

        // The kernel still holds two references, so the inode survives as
        // a tombstone.
        let inode = Inode::load(&store, f.ino).unwrap();
        assert!(inode.to_be_deleted);
        assert_eq!(inode.nlink, 0);

        fs.do_forget(f.ino, 2);
        assert!(matches!(
            Inode::load(&store, f.ino),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get_blob(f.ino).unwrap().is_empty());
    }

    #[test]
    fn unlink_without_kernel_references_erases_immediately() {
        let (_t, fs, store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_forget(f.ino, 1);

        fs.do_unlink(ROOT_INUMBER, b"f").unwrap();
        assert!(matches!(
            Inode::load(&store, f.ino),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn rename_over_an_empty_directory() {
        let (_t, fs, _store) = mount();
        let a = fs
            .make_node(ROOT_INUMBER, b"a", FileMode::dir(0o755))
            .unwrap();
        fs.make_node(ROOT_INUMBER, b"b", FileMode::dir(0o755))
            .unwrap();

        fs.do_rename(ROOT_INUMBER, b"a", ROOT_INUMBER, b"b").unwrap();

        assert_eq!(fs.do_lookup(ROOT_INUMBER, b"a").unwrap_err(), ENOENT);
        assert_eq!(fs.do_lookup(ROOT_INUMBER, b"b").unwrap().ino, a.ino);
    }

    #[test]
    fn rename_rejects_a_non_empty_target() {
        let (_t, fs, _store) = mount();
        fs.make_node(ROOT_INUMBER, b"a", FileMode::dir(0o755))
            .unwrap();
        let b = fs
            .make_node(ROOT_INUMBER, b"b", FileMode::dir(0o755))
            .unwrap();
        fs.make_node(b.ino, b"x", FileMode::file(0o644)).unwrap();

        assert_eq!(
            fs.do_rename(ROOT_INUMBER, b"a", ROOT_INUMBER, b"b")
                .unwrap_err(),
            ENOTEMPTY
        );
    }

    #[test]
    fn rename_moves_across_directories() {
        let (_t, fs, _store) = mount();
        let d1 = fs
            .make_node(ROOT_INUMBER, b"d1", FileMode::dir(0o755))
            .unwrap();
        let d2 = fs
            .make_node(ROOT_INUMBER, b"d2", FileMode::dir(0o755))
            .unwrap();
        let f = fs.make_node(d1.ino, b"f", FileMode::file(0o644)).unwrap();

        fs.do_rename(d1.ino, b"f", d2.ino, b"g").unwrap();

        assert_eq!(fs.do_lookup(d1.ino, b"f").unwrap_err(), ENOENT);
        assert_eq!(fs.do_lookup(d2.ino, b"g").unwrap().ino, f.ino);
    }

    #[test]
    fn rename_missing_source_is_enoent() {
        let (_t, fs, _store) = mount();
        assert_eq!(
            fs.do_rename(ROOT_INUMBER, b"ghost", ROOT_INUMBER, b"g")
                .unwrap_err(),
            ENOENT
        );
    }

    #[test]
    fn fallocate_mode_must_be_zero() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();

        assert_eq!(fs.do_fallocate(f.ino, 1, 0, 10).unwrap_err(), ENOSYS);

        fs.do_fallocate(f.ino, 0, 0, 10).unwrap();
        assert_eq!(fs.do_getattr(f.ino).unwrap().size, 10);

        // Allocating inside the current size changes nothing.
        fs.do_fallocate(f.ino, 0, 0, 4).unwrap();
        assert_eq!(fs.do_getattr(f.ino).unwrap().size, 10);
    }

    #[test]
    fn statfs_counts_inodes_and_bytes() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_write(f.ino, 0, b"hello").unwrap();

        let (bfree, files, ffree) = fs.do_statfs().unwrap();
        assert_eq!(files, 2);
        assert_eq!(bfree, (1u64 << 31) - 5);
        assert_eq!(ffree, i64::MAX as u64 - 2);
    }

    #[test]
    fn readdir_reports_stable_cookies() {
        let (_t, fs, _store) = mount();
        for name in [&b"a"[..], b"b", b"c"] {
            fs.make_node(ROOT_INUMBER, name, FileMode::file(0o644))
                .unwrap();
        }
        fs.do_unlink(ROOT_INUMBER, b"b").unwrap();

        let mut seen = Vec::new();
        fs.do_readdir(ROOT_INUMBER, 0, |e| {
            seen.push((e.offset, e.name.clone()));
            false
        })
        .unwrap();
        assert_eq!(seen, vec![(1, b"a".to_vec()), (3, b"c".to_vec())]);
    }

    #[test]
    fn open_touches_the_inode() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        fs.do_open(f.ino, false).unwrap();
        fs.do_open(ROOT_INUMBER, true).unwrap();
    }

    #[test]
    #[should_panic(expected = "opendir routed to non-directory")]
    fn opendir_on_a_file_is_a_routing_bug() {
        let (_t, fs, _store) = mount();
        let f = fs
            .make_node(ROOT_INUMBER, b"f", FileMode::file(0o644))
            .unwrap();
        let _ = fs.do_open(f.ino, true);
    }
}
