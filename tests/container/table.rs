// ReaderTable: insertion order, priority order and shadowing.

use std::sync::Arc;

use super::{build, id};
use iostore::container::{ContainerReader, ReaderTable, WriterSettings};
use iostore::ContainerId;

fn mount(table: &mut ReaderTable, dir: &std::path::Path, name: &str, order: i32, chunks: &[(u64, Vec<u8>)]) -> ContainerId {
    let base = build(dir, name, WriterSettings::default(), chunks);
    let id = table.next_id();
    table.insert(Arc::new(ContainerReader::open(&base, id, order).unwrap()));
    id
}

#[test]
fn ids_follow_insertion() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = ReaderTable::new();
    assert!(table.is_empty());
    let a = mount(&mut table, dir.path(), "a", 5, &[(1, vec![1])]);
    let b = mount(&mut table, dir.path(), "b", 0, &[(2, vec![2])]);
    assert_eq!((a, b), (ContainerId(0), ContainerId(1)));
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(b).unwrap().id(), b);
    assert!(table.get(ContainerId(2)).is_none());
    let inserted: Vec<_> = table.iter_by_insertion().map(|r| r.id()).collect();
    assert_eq!(inserted, vec![a, b]);
}

#[test]
fn priority_order_is_order_then_newest() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = ReaderTable::new();
    let low = mount(&mut table, dir.path(), "low", -1, &[(1, vec![0])]);
    let mid_old = mount(&mut table, dir.path(), "mid_old", 3, &[(1, vec![1])]);
    let high = mount(&mut table, dir.path(), "high", 9, &[(2, vec![2])]);
    let mid_new = mount(&mut table, dir.path(), "mid_new", 3, &[(1, vec![3])]);

    let order: Vec<_> = table.iter_by_priority().map(|r| r.id()).collect();
    assert_eq!(order, vec![high, mid_new, mid_old, low]);
}

#[test]
fn resolve_returns_first_hit_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = ReaderTable::new();
    let base = mount(&mut table, dir.path(), "base", 0, &[(1, vec![0u8; 40]), (2, vec![0u8; 7])]);
    let patch = mount(&mut table, dir.path(), "patch", 1, &[(1, vec![0u8; 99])]);

    let hit = table.resolve(&id(1)).unwrap();
    assert_eq!(hit.reader.id(), patch);
    assert_eq!((hit.offset, hit.length), (0, 99));

    let hit = table.resolve(&id(2)).unwrap();
    assert_eq!(hit.reader.id(), base);
    assert_eq!(hit.length, 7);

    assert!(table.resolve(&id(3)).is_none());
}
