//! End-to-end tree operation tests: the mkfs/insert/lookup/remove/rewrite
//! lifecycle against a real device-backed cache, including depth growth
//! and collapse, boundary handling, and cursor laws.

use std::ops::ControlFlow;

use brine::btree::{with_tree, with_tree_state, FixedKvTree};
use brine::store::{AnyExtent, BlockCache, NodeHandle};
use brine::types::{ExtentMapping, Paddr};
use tempfile::TempDir;

type Cache = BlockCache<u32, ExtentMapping>;

/// 136-byte nodes: leaf fan-out 4, internal fan-out 8.
const NODE_SIZE: usize = 136;

fn mapping(block: u64, len: u32) -> ExtentMapping {
    ExtentMapping::new(Paddr::new(block), len)
}

fn new_store() -> (TempDir, Cache) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::create(dir.path().join("index.brine"), NODE_SIZE).unwrap();

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, _tree| {
        let root_block = c.cache.duplicate_root_for_write(c.txn);
        FixedKvTree::mkfs(&root_block, c);
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();
    (dir, cache)
}

fn insert_all(cache: &Cache, keys: impl IntoIterator<Item = u32>) {
    let txn = cache.begin_transaction();
    with_tree(cache, &txn, |c, tree| {
        for key in keys {
            let (_, inserted) = tree.insert(c, key, mapping(0x1000 + key as u64, 4))?;
            assert!(inserted, "key {} already present", key);
        }
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();
}

fn remove_key(cache: &Cache, key: u32) {
    let txn = cache.begin_transaction();
    with_tree(cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, key)?;
        assert!(!cursor.is_end() && cursor.get_key() == key);
        tree.remove(c, cursor)?;
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();
}

fn depth_of(cache: &Cache) -> u16 {
    let txn = cache.begin_transaction();
    with_tree(cache, &txn, |_c, tree| Ok(tree.root().depth)).unwrap()
}

fn verify(cache: &Cache) {
    let txn = cache.begin_transaction();
    with_tree(cache, &txn, |c, tree| tree.verify_integrity(c)).unwrap();
}

fn collect_keys(cache: &Cache) -> Vec<u32> {
    let txn = cache.begin_transaction();
    with_tree_state(cache, &txn, Vec::new(), |c, tree, keys| {
        let begin = tree.begin(c)?;
        FixedKvTree::iterate_repeat(
            c,
            begin,
            |cursor| {
                if cursor.is_end() {
                    return Ok(ControlFlow::Break(()));
                }
                keys.push(cursor.get_key());
                Ok(ControlFlow::Continue(()))
            },
            None,
        )
    })
    .unwrap()
}

#[test]
fn mkfs_then_single_insert_roundtrip() {
    // Scenario: fresh tree, one mapping, read it back.
    let (_dir, cache) = new_store();

    let txn = cache.begin_transaction();
    let inserted = with_tree(&cache, &txn, |c, tree| {
        let (cursor, inserted) = tree.insert(c, 10, mapping(0x1000, 4))?;
        assert_eq!(cursor.get_key(), 10);
        Ok(inserted)
    })
    .unwrap();
    assert!(inserted);
    cache.commit(&txn).unwrap();

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 10)?;
        assert_eq!(cursor.get_key(), 10);
        assert_eq!(cursor.get_val(), mapping(0x1000, 4));
        Ok(())
    })
    .unwrap();

    verify(&cache);
}

#[test]
fn duplicate_insert_returns_existing_entry() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [10]);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let (cursor, inserted) = tree.insert(c, 10, mapping(0xdead, 1))?;
        assert!(!inserted);
        assert_eq!(cursor.get_key(), 10);
        // Original value survives.
        assert_eq!(cursor.get_val(), mapping(0x1000 + 10, 4));
        Ok(())
    })
    .unwrap();
}

#[test]
fn filling_a_leaf_then_splitting() {
    // Scenario: fill the root leaf (fan-out 4), then one more insert
    // forces a split and the tree grows to depth 2.
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20, 30, 40]);
    assert_eq!(depth_of(&cache), 1);

    insert_all(&cache, [25]);
    assert_eq!(depth_of(&cache), 2);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 25)?;
        assert_eq!(cursor.get_key(), 25);
        assert_eq!(cursor.get_val(), mapping(0x1000 + 25, 4));
        Ok(())
    })
    .unwrap();

    assert_eq!(collect_keys(&cache), vec![10, 20, 25, 30, 40]);
    verify(&cache);
}

#[test]
fn insert_at_extreme_right_of_full_leaf() {
    // The split re-seating rule: a cursor at the far right of a full leaf
    // must land in the right-hand node after the split.
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20, 30, 40]);
    insert_all(&cache, [50]);

    assert_eq!(collect_keys(&cache), vec![10, 20, 30, 40, 50]);
    assert_eq!(depth_of(&cache), 2);
    verify(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 50)?;
        assert_eq!(cursor.get_key(), 50);
        Ok(())
    })
    .unwrap();
}

#[test]
fn growth_to_depth_three() {
    // Scenario: inserts 0, 4, 8, ..., 252 push the tree to depth 3.
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));

    assert_eq!(depth_of(&cache), 3);
    verify(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let begin = tree.begin(c)?;
        assert_eq!(begin.get_key(), 0);
        assert!(begin.is_begin());

        let end = tree.end(c)?;
        assert!(end.is_end());

        // 5 is covered by the mapping starting at 4 (len 4).
        let covering = tree.upper_bound_right(c, 5)?;
        assert_eq!(covering.get_key(), 4);

        // 130 falls inside the mapping starting at 128 (len 4).
        let covering = tree.upper_bound_right(c, 130)?;
        assert_eq!(covering.get_key(), 128);
        Ok(())
    })
    .unwrap();

    let expected: Vec<u32> = (0..64).map(|i| i * 4).collect();
    assert_eq!(collect_keys(&cache), expected);
}

#[test]
fn remove_reseats_cursor_and_keeps_depth() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 4)?;
        let after = tree.remove(c, cursor)?;
        assert_eq!(after.get_key(), 8);
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    assert_eq!(depth_of(&cache), 3);
    verify(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 4)?;
        assert_eq!(cursor.get_key(), 8);
        Ok(())
    })
    .unwrap();
}

#[test]
fn removals_trigger_merges_and_keep_invariants() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));

    // Remove a contiguous run so sibling leaves fall to min capacity and
    // full merges cascade.
    for key in (0..32).map(|i| i * 4) {
        remove_key(&cache, key);
        verify(&cache);
    }

    let expected: Vec<u32> = (32..64).map(|i| i * 4).collect();
    assert_eq!(collect_keys(&cache), expected);
}

#[test]
fn remove_driven_root_collapse_to_single_leaf() {
    // Depth 3 back down to 1 as the keyspace empties.
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));
    assert_eq!(depth_of(&cache), 3);

    let mut keys: Vec<u32> = (0..64).map(|i| i * 4).collect();
    while keys.len() > 2 {
        let key = keys.remove(keys.len() / 2);
        remove_key(&cache, key);
        verify(&cache);
    }

    assert_eq!(depth_of(&cache), 1);
    assert_eq!(collect_keys(&cache), keys);
}

#[test]
fn remove_last_entry_leaves_empty_root() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [7]);
    remove_key(&cache, 7);

    assert_eq!(depth_of(&cache), 1);
    assert_eq!(collect_keys(&cache), Vec::<u32>::new());

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.begin(c)?;
        assert!(cursor.is_end());
        assert!(cursor.is_begin());
        Ok(())
    })
    .unwrap();
}

#[test]
fn update_is_idempotent() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20, 30]);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 20)?;
        let cursor = tree.update(c, cursor, mapping(0x9000, 8))?;
        let cursor = tree.update(c, cursor, mapping(0x9000, 8))?;
        assert_eq!(cursor.get_val(), mapping(0x9000, 8));
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 20)?;
        assert_eq!(cursor.get_val(), mapping(0x9000, 8));
        Ok(())
    })
    .unwrap();
}

#[test]
fn insert_remove_restores_entry_set() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..32).map(|i| i * 8));
    let before = collect_keys(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let (cursor, inserted) = tree.insert(c, 101, mapping(0xabc, 4))?;
        assert!(inserted);
        assert_eq!(cursor.get_key(), 101);
        let cursor = tree.lower_bound(c, 101)?;
        tree.remove(c, cursor)?;
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    assert_eq!(collect_keys(&cache), before);
    verify(&cache);
}

#[test]
fn upper_bound_steps_past_exact_match() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20, 30]);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.upper_bound(c, 20)?;
        assert_eq!(cursor.get_key(), 30);

        let cursor = tree.upper_bound(c, 15)?;
        assert_eq!(cursor.get_key(), 20);

        let cursor = tree.upper_bound(c, 30)?;
        assert!(cursor.is_end());
        Ok(())
    })
    .unwrap();
}

#[test]
fn ordered_walk_between_two_keys() {
    // Walking next() from lower_bound(k1) reaches lower_bound(k2) without
    // skipping or revisiting keys.
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..48).map(|i| i * 2));

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let mut cursor = tree.lower_bound(c, 10)?;
        let target = tree.lower_bound(c, 70)?.get_key();

        let mut seen = Vec::new();
        while cursor.get_key() != target {
            seen.push(cursor.get_key());
            cursor = cursor.next(c, None)?;
        }
        assert_eq!(seen, (5..35).map(|i| i * 2).collect::<Vec<u32>>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn prev_walks_backward_across_leaves() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..32).map(|i| i * 4));

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let end = tree.end(c)?;
        assert!(end.is_end());

        let mut cursor = end.prev(c)?;
        let mut seen = Vec::new();
        loop {
            seen.push(cursor.get_key());
            if cursor.is_begin() {
                break;
            }
            cursor = cursor.prev(c)?;
        }
        seen.reverse();
        assert_eq!(seen, (0..32).map(|i| i * 4).collect::<Vec<u32>>());
        Ok(())
    })
    .unwrap();
}

#[test]
#[should_panic(expected = "prev() before begin")]
fn prev_at_begin_is_guarded() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20]);

    let txn = cache.begin_transaction();
    let _ = with_tree(&cache, &txn, |c, tree| {
        let begin = tree.begin(c)?;
        assert!(begin.is_begin());
        let _ = begin.prev(c)?;
        Ok(())
    });
}

#[test]
fn partial_cursor_materializes_ancestors() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..32).map(|i| i * 4));
    assert!(depth_of(&cache) > 1);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let full = tree.lower_bound(c, 40)?;
        let leaf = full.get_leaf_node();
        let pos = full.get_leaf_pos();

        // Rebuild the same position as a partial cursor and step it in
        // both directions, forcing ancestor materialization.
        let partial = tree.make_partial_iter(c, leaf, 40, pos);
        let next = partial.next(c, None)?;
        assert_eq!(next.get_key(), 44);
        let prev = partial.prev(c)?;
        assert_eq!(prev.get_key(), 36);
        Ok(())
    })
    .unwrap();
}

#[test]
fn rewrite_extent_relocates_leaf() {
    // Scenario: rewrite the leaf containing key 100; liveness queries
    // must flip from the old address to the new one, keys unchanged.
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));
    let before = collect_keys(&cache);

    let txn = cache.begin_transaction();
    let (old_paddr, new_paddr) = with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 100)?;
        let leaf = cursor.get_leaf_node();
        let old_paddr = leaf.paddr();

        tree.rewrite_extent(c, AnyExtent::Node(NodeHandle::Leaf(leaf)))?;

        let cursor = tree.lower_bound(c, 100)?;
        let new_paddr = cursor.get_leaf_node().paddr();
        assert_ne!(old_paddr, new_paddr);

        assert!(tree.get_leaf_if_live(c, old_paddr, 100)?.is_none());
        assert!(tree.get_leaf_if_live(c, new_paddr, 100)?.is_some());
        Ok((old_paddr, new_paddr))
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    // Still true from a fresh transaction after commit.
    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        assert!(tree.get_leaf_if_live(c, old_paddr, 100)?.is_none());
        assert!(tree.get_leaf_if_live(c, new_paddr, 100)?.is_some());
        Ok(())
    })
    .unwrap();

    assert_eq!(collect_keys(&cache), before);
    verify(&cache);
}

#[test]
fn rewrite_extent_relocates_internal_node() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..64).map(|i| i * 4));
    assert_eq!(depth_of(&cache), 3);
    let before = collect_keys(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        // Pick the depth-2 ancestor of key 0.
        let node = tree
            .lower_bound(c, 0)
            .and_then(|cursor| {
                Ok(cursor
                    .get_leaf_node()
                    .parent_node()
                    .expect("depth-3 tree has parents"))
            })?;
        let old_paddr = node.paddr();
        let begin = node.meta().begin;

        tree.rewrite_extent(c, AnyExtent::Node(NodeHandle::Internal(node)))?;

        assert!(tree.get_internal_if_live(c, old_paddr, begin)?.is_none());
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    assert_eq!(collect_keys(&cache), before);
    verify(&cache);
}

#[test]
fn init_cached_extent_reports_liveness() {
    let (_dir, cache) = new_store();
    insert_all(&cache, (0..16).map(|i| i * 4));

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let leaf = tree.lower_bound(c, 8)?.get_leaf_node();
        let live = tree.init_cached_extent(c, &AnyExtent::Node(NodeHandle::Leaf(leaf.clone())))?;
        assert!(live);

        // A rewrite retires the leaf; the old handle is no longer live.
        tree.rewrite_extent(c, AnyExtent::Node(NodeHandle::Leaf(leaf.clone())))?;
        let live = tree.init_cached_extent(c, &AnyExtent::Node(NodeHandle::Leaf(leaf)))?;
        assert!(!live);

        // Extents the index does not own are always live.
        let data = c.cache.alloc_data(c.txn, brine::types::PlacementHint::Hot, 0);
        assert!(tree.init_cached_extent(c, &AnyExtent::Data(data))?);
        Ok(())
    })
    .unwrap();
}

#[test]
fn stats_track_operations() {
    let (_dir, cache) = new_store();
    insert_all(&cache, [10, 20, 30]);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 20)?;
        tree.update(c, cursor, mapping(0x1, 1))?;
        let cursor = tree.lower_bound(c, 10)?;
        tree.remove(c, cursor)?;
        Ok(())
    })
    .unwrap();
    cache.commit(&txn).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.num_inserts, 3);
    assert_eq!(stats.num_updates, 1);
    assert_eq!(stats.num_erases, 1);
    // mkfs allocated the root leaf; nothing else outlived its txn.
    assert_eq!(stats.extents_num_delta, 1);
}

#[test]
fn store_reopen_reads_committed_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.brine");
    {
        let cache = Cache::create(&path, NODE_SIZE).unwrap();
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, _tree| {
            let root_block = c.cache.duplicate_root_for_write(c.txn);
            FixedKvTree::mkfs(&root_block, c);
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
        insert_all(&cache, (0..64).map(|i| i * 4));
    }

    let cache = Cache::open(&path).unwrap();
    assert_eq!(depth_of(&cache), 3);
    let expected: Vec<u32> = (0..64).map(|i| i * 4).collect();
    assert_eq!(collect_keys(&cache), expected);

    // Values survive the on-disk relativization roundtrip.
    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let cursor = tree.lower_bound(c, 100)?;
        assert_eq!(cursor.get_val(), mapping(0x1000 + 100, 4));
        Ok(())
    })
    .unwrap();
    verify(&cache);
}
