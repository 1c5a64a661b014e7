use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use stratadb::common::types::Rid;
use stratadb::index::btree::BPlusTree;
use stratadb::storage::buffer::BufferPoolManager;

mod common;
use common::{create_temp_db_file, create_test_buffer_pool};

fn rid_for(key: i64) -> Rid {
    Rid::new((key / 1000) as u32, (key % 1000) as u32)
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 8, 8)?;

    assert!(tree.is_empty());
    for key in [5i64, 3, 8, 1, 9, 2, 7] {
        assert!(tree.insert(key, rid_for(key))?);
    }
    assert!(!tree.is_empty());

    for key in [5i64, 3, 8, 1, 9, 2, 7] {
        assert_eq!(tree.get_value(&key)?, Some(rid_for(key)));
    }
    assert_eq!(tree.get_value(&4)?, None);
    assert_eq!(tree.get_value(&100)?, None);
    Ok(())
}

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 8, 8)?;

    assert!(tree.insert(42, rid_for(42))?);
    assert!(!tree.insert(42, Rid::new(9, 9))?);
    // The original value survives
    assert_eq!(tree.get_value(&42)?, Some(rid_for(42)));
    Ok(())
}

#[test]
fn test_splits_preserve_lookups() -> Result<()> {
    // Small fanout so a few hundred keys build several levels
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 4, 4)?;

    for key in 0..300i64 {
        assert!(tree.insert(key, rid_for(key))?);
    }
    for key in 0..300i64 {
        assert_eq!(tree.get_value(&key)?, Some(rid_for(key)), "key {}", key);
    }
    Ok(())
}

#[test]
fn test_remove_returns_presence() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 8, 8)?;

    for key in 0..20i64 {
        tree.insert(key, rid_for(key))?;
    }
    assert!(tree.remove(&7)?);
    assert!(!tree.remove(&7)?);
    assert_eq!(tree.get_value(&7)?, None);
    assert_eq!(tree.get_value(&8)?, Some(rid_for(8)));
    Ok(())
}

#[test]
fn test_remove_until_empty_and_reuse() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 4, 4)?;

    for key in 0..100i64 {
        tree.insert(key, rid_for(key))?;
    }
    for key in 0..100i64 {
        assert!(tree.remove(&key)?, "key {}", key);
    }
    assert!(tree.is_empty());
    assert_eq!(tree.get_value(&50)?, None);
    assert_eq!(tree.begin()?.count(), 0);

    // The emptied tree accepts new keys
    for key in 200..260i64 {
        assert!(tree.insert(key, rid_for(key))?);
    }
    let keys: Vec<i64> = tree.begin()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (200..260).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_iterator_visits_keys_in_order() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 4, 4)?;

    let mut keys: Vec<i64> = (0..200).map(|i| i * 3).collect();
    let mut rng = StdRng::seed_from_u64(7);
    keys.shuffle(&mut rng);
    for &key in &keys {
        tree.insert(key, rid_for(key))?;
    }

    let visited: Vec<(i64, Rid)> = tree.begin()?.collect();
    let expected: Vec<i64> = (0..200).map(|i| i * 3).collect();
    assert_eq!(visited.len(), expected.len());
    for (i, (key, rid)) in visited.iter().enumerate() {
        assert_eq!(*key, expected[i]);
        assert_eq!(*rid, rid_for(*key));
    }
    Ok(())
}

#[test]
fn test_iterator_from_key() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 4, 4)?;

    for key in (0..100i64).map(|i| i * 2) {
        tree.insert(key, rid_for(key))?;
    }

    // Present key: starts exactly there
    let keys: Vec<i64> = tree.begin_at(&50)?.map(|(k, _)| k).take(3).collect();
    assert_eq!(keys, vec![50, 52, 54]);

    // Absent key: starts at the next larger one
    let keys: Vec<i64> = tree.begin_at(&51)?.map(|(k, _)| k).take(3).collect();
    assert_eq!(keys, vec![52, 54, 56]);

    // Past the maximum: empty
    assert_eq!(tree.begin_at(&500)?.count(), 0);
    Ok(())
}

#[test]
fn test_empty_tree_operations() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16, 2)?;
    let tree = BPlusTree::<i64>::new("t", buffer_pool, 8, 8)?;

    assert_eq!(tree.get_value(&1)?, None);
    assert!(!tree.remove(&1)?);
    assert_eq!(tree.begin()?.count(), 0);
    assert_eq!(tree.begin_at(&1)?.count(), 0);
    Ok(())
}

#[test]
fn test_root_recovered_across_reopen() -> Result<()> {
    let (file, path) = create_temp_db_file()?;

    {
        let buffer_pool = Arc::new(BufferPoolManager::new(32, 2, &path)?);
        let tree = BPlusTree::<i64>::new("orders_pk", Arc::clone(&buffer_pool), 8, 8)?;
        for key in 0..200i64 {
            tree.insert(key, rid_for(key))?;
        }
        buffer_pool.flush_all_pages()?;
    }

    let buffer_pool = Arc::new(BufferPoolManager::new(32, 2, &path)?);
    let tree = BPlusTree::<i64>::new("orders_pk", Arc::clone(&buffer_pool), 8, 8)?;
    assert!(!tree.is_empty());
    for key in 0..200i64 {
        assert_eq!(tree.get_value(&key)?, Some(rid_for(key)), "key {}", key);
    }

    drop(file);
    Ok(())
}

#[test]
fn test_two_indexes_share_one_file() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32, 2)?;
    let orders = BPlusTree::<i64>::new("orders_pk", Arc::clone(&buffer_pool), 8, 8)?;
    let users = BPlusTree::<i64>::new("users_pk", buffer_pool, 8, 8)?;

    for key in 0..50i64 {
        orders.insert(key, rid_for(key))?;
        users.insert(key, rid_for(key + 1000))?;
    }
    assert_ne!(orders.root_page_id(), users.root_page_id());
    for key in 0..50i64 {
        assert_eq!(orders.get_value(&key)?, Some(rid_for(key)));
        assert_eq!(users.get_value(&key)?, Some(rid_for(key + 1000)));
    }
    Ok(())
}

#[test]
fn test_scale_insert_remove_reinsert() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64, 2)?;
    let tree = BPlusTree::<i64>::new("scale", buffer_pool, 32, 32)?;
    let mut rng = StdRng::seed_from_u64(445);

    let mut keys: Vec<i64> = (1..5000).collect();
    keys.shuffle(&mut rng);
    for &key in &keys {
        assert!(tree.insert(key, rid_for(key))?);
    }

    // Remove a random half, re-insert it, then remove it again
    let mut halved = keys.clone();
    halved.shuffle(&mut rng);
    let (removed, surviving) = halved.split_at(halved.len() / 2);
    for &key in removed {
        assert!(tree.remove(&key)?, "key {}", key);
    }
    for &key in removed {
        assert!(tree.insert(key, rid_for(key))?, "key {}", key);
    }
    for &key in removed {
        assert!(tree.remove(&key)?, "key {}", key);
    }

    for &key in surviving {
        assert_eq!(tree.get_value(&key)?, Some(rid_for(key)), "key {}", key);
    }
    for &key in removed {
        assert_eq!(tree.get_value(&key)?, None, "key {}", key);
    }

    let mut expected: Vec<i64> = surviving.to_vec();
    expected.sort_unstable();
    let visited: Vec<i64> = tree.begin()?.map(|(k, _)| k).collect();
    assert_eq!(visited, expected);
    Ok(())
}
