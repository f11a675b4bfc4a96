//! Integration tests for catalogs: part accounting, packing and the cache.

use searchfabric::catalog::{Catalog, CatalogCache, CatalogOptions};
use searchfabric::files::{update_catalog, CatalogUpload, SafeLocks};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options(limit: u64, delim: &str) -> CatalogOptions {
    CatalogOptions {
        data_size_limit: limit,
        default_delimiter: delim.to_string(),
        drop_timeout: Duration::from_millis(100),
    }
}

/// `(data id, accounted length, sum of part lengths plus delimiters)` read
/// straight from the catalog database.
fn accounting(path: &std::path::Path) -> Vec<(i64, i64, i64)> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT d.id, d.len,
                    ifnull((SELECT SUM(p.len + ifnull(length(d.delim), 0))
                            FROM parts AS p WHERE p.d_id = d.id), 0)
             FROM data AS d ORDER BY d.id",
        )
        .unwrap();
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

#[test]
fn single_node_append_packs_parts_until_the_limit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.db");
    let cat = Catalog::open(&path, &options(50, "\r\n")).unwrap();

    let one = cat.add_file_part("1.txt", -1, 17, None).unwrap();
    let two = cat.add_file_part("2.txt", -1, 17, None).unwrap();
    let three = cat.add_file_part("3.txt", -1, 17, None).unwrap();

    assert_eq!(one.data_pos, 0);
    assert_eq!(two.data_path, one.data_path);
    assert_eq!(two.data_pos, 19);
    assert_ne!(three.data_path, one.data_path);
    assert_eq!(three.data_pos, 0);
    assert_eq!(one.delimiter, "\r\n");

    let files = cat.get_data_files(None, true).unwrap();
    assert_eq!(files, vec![one.data_path.clone(), three.data_path.clone()]);
    assert!(one.data_path.starts_with(cat.data_dir()));
}

#[test]
fn accounted_length_matches_parts_and_stays_under_limit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.db");
    let limit = 100;
    let cat = Catalog::open(&path, &options(limit, "\n")).unwrap();

    for i in 0..25u64 {
        let name = format!("f{}.txt", i % 4);
        cat.add_file_part(&name, -1, 5 + (i * 7) % 30, None).unwrap();
    }
    // a contained write registers nothing new
    cat.add_file_part("f0.txt", 0, 3, None).unwrap();
    cat.close();

    let rows = accounting(&path);
    assert!(rows.len() > 1);
    for (id, len, sum) in rows {
        assert_eq!(len, sum, "data file {id}");
        assert!(len as u64 <= limit, "data file {id} is over the limit");
    }
}

#[test]
fn parts_of_one_file_never_partially_overlap() {
    let dir = TempDir::new().unwrap();
    let cat = Catalog::open(dir.path().join("c.db"), &options(0, "\n")).unwrap();

    cat.add_file_part("a.txt", 0, 100, None).unwrap();
    let err = cat.add_file_part("a.txt", 50, 100, None).unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert!(err.to_string().contains("part will override existing part"));

    cat.add_file_part("a.txt", 100, 10, None).unwrap();
    cat.add_file_part("a.txt", 20, 30, None).unwrap();
    let err = cat.add_file_part("a.txt", 95, 10, None).unwrap_err();
    assert_eq!(err.status_code(), 409);

    // another name may use the same range
    cat.add_file_part("b.txt", 50, 100, None).unwrap();

    let index = cat.get_search_index_file().unwrap();
    let mut ranges: Vec<(u64, u64)> = index
        .values()
        .flat_map(|f| f.items.iter())
        .filter(|it| it.file == "a.txt")
        .map(|it| (it.offset, it.offset + it.length))
        .collect();
    ranges.sort();
    assert_eq!(ranges, vec![(0, 100), (100, 110)]);
}

#[test]
fn concurrent_appends_book_every_byte_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.db");
    let cat = Arc::new(Catalog::open(&path, &options(4096, "\n")).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cat = cat.clone();
            std::thread::spawn(move || {
                let mut booked = 0u64;
                for i in 0..20u64 {
                    let len = 1 + (t * 13 + i * 7) % 50;
                    let slot = cat
                        .add_file_part(&format!("t{t}.txt"), -1, len, None)
                        .unwrap();
                    booked += len + slot.delimiter.len() as u64;
                }
                booked
            })
        })
        .collect();
    let booked: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(cat.get_total_data_size().unwrap(), booked);

    // per file, automatic offsets follow each other without gaps
    let index = cat.get_search_index_file().unwrap();
    let mut per_file: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
    for item in index.values().flat_map(|f| f.items.iter()) {
        per_file
            .entry(item.file.clone())
            .or_default()
            .push((item.offset, item.length));
    }
    for (name, mut parts) in per_file {
        parts.sort();
        let mut next = 0;
        for (offset, length) in parts {
            assert_eq!(offset, next, "{name}");
            next += length;
        }
    }
}

#[test]
fn index_partitions_each_data_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.db");
    let cat = Catalog::open(&path, &options(64, "\n\n")).unwrap();
    for (i, len) in [10u64, 20, 5, 30, 12, 7, 40].into_iter().enumerate() {
        cat.add_file_part(&format!("{}.txt", i % 3), -1, len, None).unwrap();
    }

    let index = cat.get_search_index_file().unwrap();
    let files = cat.get_data_files(None, false).unwrap();
    assert_eq!(files.len(), index.len());
    let mut covered = 0;
    for path in &files {
        let file = &index[path];
        let mut pos = 0;
        for item in &file.items {
            assert_eq!(item.data_pos, pos, "{}", path.display());
            pos = item.data_pos + item.length + file.delimiter.len() as u64;
        }
        covered += pos;
    }
    assert_eq!(covered, cat.get_total_data_size().unwrap());
}

#[test]
fn automatic_offsets_follow_previous_parts() {
    let dir = TempDir::new().unwrap();
    let cat = Catalog::open(dir.path().join("c.db"), &options(0, "\n")).unwrap();
    assert_eq!(cat.add_file_part("x", -1, 11, None).unwrap().offset, 0);
    assert_eq!(cat.add_file_part("x", -1, 4, None).unwrap().offset, 11);
}

#[tokio::test]
async fn cache_reuses_handle_until_idle_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.db");
    let cache = CatalogCache::new(options(0, "\n"));

    let first = cache.open(&path).unwrap();
    let cached = first.catalog().clone();
    drop(first);
    let second = cache.open(&path).unwrap();
    assert!(Arc::ptr_eq(second.catalog(), &cached));
    drop(second);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = cache.open(&path).unwrap();
    assert!(!Arc::ptr_eq(third.catalog(), &cached));
}

#[tokio::test]
async fn uploaded_parts_read_back_through_file_view() {
    let dir = TempDir::new().unwrap();
    let cache = CatalogCache::new(options(0, "\n"));
    let locks = SafeLocks::new();

    for (offset, chunk) in [(Some(0), "hello "), (None, "world")] {
        update_catalog(
            dir.path(),
            &CatalogUpload {
                catalog: "docs.db".to_string(),
                file: "greeting.txt".to_string(),
                offset,
                ..Default::default()
            },
            chunk.as_bytes(),
            &cache,
            &locks,
        )
        .await
        .unwrap();
    }

    let cat = cache.open_read_only(dir.path().join("docs.db")).unwrap();
    let mut view = cat.get_file("greeting.txt").unwrap();
    let mut text = String::new();
    view.read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello world");
}
