#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::common::{FileMode, TimeSpec};
    use crate::models::InodeRecord;
    use crate::store::{StoreError, StoreGateway};

    fn open_store() -> (TempDir, StoreGateway) {
        let dir = TempDir::new().unwrap();
        let store = StoreGateway::open(&dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    fn record(inumber: u64, size: u64) -> InodeRecord {
        let now = TimeSpec::now();
        InodeRecord {
            inumber,
            size,
            nlink: 1,
            mode: FileMode::file(0o644).bits(),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            uid: 1000,
            gid: 1000,
            to_be_deleted: false,
        }
    }

    #[test]
    fn inode_round_trip() {
        let (_dir, store) = open_store();
        let rec = record(3, 42);
        store.upsert_inode(&rec).unwrap();
        assert_eq!(store.get_inode(3).unwrap(), rec);
    }

    #[test]
    fn missing_inode_is_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(store.get_inode(7), Err(StoreError::NotFound(7))));
    }

    #[test]
    fn upsert_replaces_the_previous_record() {
        let (_dir, store) = open_store();
        store.upsert_inode(&record(2, 1)).unwrap();
        store.upsert_inode(&record(2, 99)).unwrap();
        assert_eq!(store.get_inode(2).unwrap().size, 99);
    }

    #[test]
    fn absent_blob_reads_as_empty() {
        let (_dir, store) = open_store();
        assert!(store.get_blob(5).unwrap().is_empty());
    }

    #[test]
    fn blob_round_trip() {
        let (_dir, store) = open_store();
        store.upsert_blob(4, b"payload").unwrap();
        assert_eq!(store.get_blob(4).unwrap(), b"payload");
    }

    #[test]
    fn next_inumber_starts_at_one() {
        let (_dir, store) = open_store();
        assert_eq!(store.next_inumber().unwrap(), 1);
    }

    #[test]
    fn next_inumber_is_max_plus_one() {
        let (_dir, store) = open_store();
        store.upsert_inode(&record(1, 0)).unwrap();
        store.upsert_inode(&record(5, 0)).unwrap();
        assert_eq!(store.next_inumber().unwrap(), 6);
    }

    #[test]
    fn delete_removes_both_rows_and_is_idempotent() {
        let (_dir, store) = open_store();
        store.upsert_inode(&record(2, 3)).unwrap();
        store.upsert_blob(2, b"abc").unwrap();
        store.delete_inode(2).unwrap();
        assert!(matches!(store.get_inode(2), Err(StoreError::NotFound(2))));
        assert!(store.get_blob(2).unwrap().is_empty());
        // A second delete of the same rows is not an error.
        store.delete_inode(2).unwrap();
    }

    #[test]
    fn space_used_sums_inode_sizes() {
        let (_dir, store) = open_store();
        assert_eq!(store.space_used(), 0);
        store.upsert_inode(&record(1, 10)).unwrap();
        store.upsert_inode(&record(2, 32)).unwrap();
        assert_eq!(store.space_used(), 42);
    }
}
