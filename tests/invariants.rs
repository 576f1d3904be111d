//! Randomized structural-invariant checks and transaction isolation
//! tests. A seeded RNG drives batches of inserts/updates/removes against
//! a reference model; after every committed batch the tree must agree
//! with the model and pass the full structural audit (capacity bounds,
//! key ordering, parent/child ranges, uniform depth, child-pointer
//! linkage).

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use brine::btree::{with_tree, with_tree_state, FixedKvTree};
use brine::store::BlockCache;
use brine::types::{ExtentMapping, Paddr};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

type Cache = BlockCache<u32, ExtentMapping>;

/// 136-byte nodes: leaf fan-out 4, internal fan-out 8.
const NODE_SIZE: usize = 136;

fn mapping(key: u32) -> ExtentMapping {
    ExtentMapping::new(Paddr::new(0x4000 + key as u64), 4)
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

fn scan(cache: &Cache) -> Vec<(u32, ExtentMapping)> {
    let txn = cache.begin_transaction();
    with_tree_state(cache, &txn, Vec::new(), |c, tree, out| {
        let begin = tree.begin(c)?;
        FixedKvTree::iterate_repeat(
            c,
            begin,
            |cursor| {
                if cursor.is_end() {
                    return Ok(ControlFlow::Break(()));
                }
                out.push((cursor.get_key(), cursor.get_val()));
                Ok(ControlFlow::Continue(()))
            },
            None,
        )
    })
    .unwrap()
}

fn verify(cache: &Cache) {
    let txn = cache.begin_transaction();
    with_tree(cache, &txn, |c, tree| tree.verify_integrity(c)).unwrap();
}

#[test]
fn randomized_ops_agree_with_model() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x00b7_ee00);
    let (_dir, cache) = new_store();
    let mut model: BTreeMap<u32, ExtentMapping> = BTreeMap::new();

    for _batch in 0..40 {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for _ in 0..16 {
                let key = rng.gen_range(0..512u32) * 4;
                match rng.gen_range(0..10) {
                    // Inserts dominate so the tree actually grows.
                    0..=5 => {
                        let val = mapping(key);
                        let (_, inserted) = tree.insert(c, key, val)?;
                        assert_eq!(inserted, !model.contains_key(&key));
                        model.entry(key).or_insert(val);
                    }
                    6..=7 => {
                        if model.remove(&key).is_some() {
                            let cursor = tree.lower_bound(c, key)?;
                            assert_eq!(cursor.get_key(), key);
                            tree.remove(c, cursor)?;
                        }
                    }
                    _ => {
                        if model.contains_key(&key) {
                            let val = ExtentMapping::new(
                                Paddr::new(0x9000 + key as u64),
                                8,
                            );
                            let cursor = tree.lower_bound(c, key)?;
                            tree.update(c, cursor, val)?;
                            model.insert(key, val);
                        }
                    }
                }
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();

        verify(&cache);
        let expected: Vec<(u32, ExtentMapping)> =
            model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(scan(&cache), expected);
    }
}

#[test]
fn randomized_drain_returns_to_empty() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xd7a1_4);
    let (_dir, cache) = new_store();

    let mut keys: Vec<u32> = (0..128).map(|i| i * 4).collect();
    {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for key in &keys {
                tree.insert(c, *key, mapping(*key))?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
    }
    verify(&cache);

    while !keys.is_empty() {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for _ in 0..8.min(keys.len()) {
                let idx = rng.gen_range(0..keys.len());
                let key = keys.swap_remove(idx);
                let cursor = tree.lower_bound(c, key)?;
                assert_eq!(cursor.get_key(), key);
                tree.remove(c, cursor)?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
        verify(&cache);
    }

    assert!(scan(&cache).is_empty());

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |_c, tree| {
        assert_eq!(tree.root().depth, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn uncommitted_writes_are_invisible_to_other_transactions() {
    // Scenario: T1 inserts 50; T2 reads before T1 commits and sees
    // nothing; a fresh transaction after commit sees it.
    let (_dir, cache) = new_store();

    let t1 = cache.begin_transaction();
    with_tree(&cache, &t1, |c, tree| {
        tree.insert(c, 50, mapping(50))?;
        Ok(())
    })
    .unwrap();

    let t2 = cache.begin_transaction();
    with_tree(&cache, &t2, |c, tree| {
        let cursor = tree.lower_bound(c, 50)?;
        assert!(cursor.is_end(), "t2 observed t1's uncommitted insert");
        Ok(())
    })
    .unwrap();

    cache.commit(&t1).unwrap();

    // T2 restarts against the committed view.
    let t3 = cache.begin_transaction();
    with_tree(&cache, &t3, |c, tree| {
        let cursor = tree.lower_bound(c, 50)?;
        assert_eq!(cursor.get_key(), 50);
        assert_eq!(cursor.get_val(), mapping(50));
        Ok(())
    })
    .unwrap();
}

#[test]
fn uncommitted_structural_changes_are_isolated() {
    // T1 drives the tree through splits; a concurrent reader still sees
    // the small committed tree.
    let (_dir, cache) = new_store();
    {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for key in [10u32, 20, 30] {
                tree.insert(c, key, mapping(key))?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
    }

    let t1 = cache.begin_transaction();
    with_tree(&cache, &t1, |c, tree| {
        for key in (0..64).map(|i| 100 + i * 4) {
            tree.insert(c, key, mapping(key))?;
        }
        // T1 sees its own writes, including through splits.
        assert!(tree.root().depth > 1);
        let cursor = tree.lower_bound(c, 100)?;
        assert_eq!(cursor.get_key(), 100);
        Ok(())
    })
    .unwrap();

    let t2 = cache.begin_transaction();
    with_tree(&cache, &t2, |c, tree| {
        assert_eq!(tree.root().depth, 1);
        let cursor = tree.lower_bound(c, 100)?;
        assert!(cursor.is_end());
        Ok(())
    })
    .unwrap();

    cache.commit(&t1).unwrap();
    verify(&cache);
    assert_eq!(scan(&cache).len(), 3 + 64);
}

#[test]
fn abandoned_transaction_leaves_stable_view_unchanged() {
    let (_dir, cache) = new_store();
    {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for key in (0..32).map(|i| i * 4) {
                tree.insert(c, key, mapping(key))?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
    }
    let before = scan(&cache);

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        // A mix of structural mutations, then walk away.
        for key in (0..32).map(|i| 2 + i * 4) {
            tree.insert(c, key, mapping(key))?;
        }
        let cursor = tree.lower_bound(c, 0)?;
        tree.remove(c, cursor)?;
        Ok(())
    })
    .unwrap();
    cache.abandon(&txn);

    assert_eq!(scan(&cache), before);
    verify(&cache);
}

#[test]
fn transaction_view_tracks_pending_extents() {
    let (_dir, cache) = new_store();

    let txn = cache.begin_transaction();
    let leaf_paddr = with_tree(&cache, &txn, |c, tree| {
        // Force a split so the cursor lands on a freshly allocated leaf.
        for key in [10u32, 20, 30, 40, 50] {
            tree.insert(c, key, mapping(key))?;
        }
        Ok(tree.lower_bound(c, 10)?.get_leaf_node().paddr())
    })
    .unwrap();

    use brine::store::ExtentPresence;
    assert_eq!(txn.get_extent(leaf_paddr), ExtentPresence::Present);

    let other = cache.begin_transaction();
    assert_eq!(other.get_extent(leaf_paddr), ExtentPresence::Absent);

    // Not resident in the committed index until commit publishes it.
    assert!(!cache.test_query_cache(leaf_paddr));
    cache.commit(&txn).unwrap();
    assert!(cache.test_query_cache(leaf_paddr));
}

#[test]
fn weak_transaction_reads_committed_tree() {
    let (_dir, cache) = new_store();
    {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for key in (0..32).map(|i| i * 4) {
                tree.insert(c, key, mapping(key))?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
    }

    let weak = cache.begin_weak_transaction();
    assert!(weak.is_weak());
    with_tree(&cache, &weak, |c, tree| {
        let mut cursor = tree.begin(c)?;
        let mut count = 0;
        while !cursor.is_end() {
            count += 1;
            cursor = cursor.next(c, None)?;
        }
        assert_eq!(count, 32);
        Ok(())
    })
    .unwrap();
}

#[test]
fn visitor_observes_every_level() {
    let (_dir, cache) = new_store();
    {
        let txn = cache.begin_transaction();
        with_tree(&cache, &txn, |c, tree| {
            for key in (0..64).map(|i| i * 4) {
                tree.insert(c, key, mapping(key))?;
            }
            Ok(())
        })
        .unwrap();
        cache.commit(&txn).unwrap();
    }

    let txn = cache.begin_transaction();
    with_tree(&cache, &txn, |c, tree| {
        let depth = tree.root().depth;
        assert_eq!(depth, 3);

        let mut seen_depths = Vec::new();
        let mut visitor = |paddr: Paddr,
                           _begin: u32,
                           len: u32,
                           d: u16,
                           _kind: brine::types::ExtentKind,
                           _cursor: &brine::btree::Cursor<u32, ExtentMapping>| {
            assert!(paddr.is_absolute());
            assert_eq!(len as usize, NODE_SIZE);
            seen_depths.push(d);
        };
        tree.lower_bound_with(c, 128, Some(&mut visitor), 1)?;

        // Root-to-leaf path, one callback per level.
        assert_eq!(seen_depths, vec![3, 2, 1]);
        Ok(())
    })
    .unwrap();
}
