use molt::HashMap;
use rand::Rng;

#[test]
fn new_map_is_usable() {
    let map = HashMap::<usize, usize>::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get(&42), None);
}

#[test]
fn default_map_is_usable() {
    let map = HashMap::<usize, usize>::default();
    assert_eq!(map.remove(&42), None);
    assert!(map.is_empty());
}

#[test]
fn insert_and_get() {
    let map = HashMap::new();
    map.insert("a", 1);
    map.insert("b", 2);
    assert_eq!(map.get("a"), Some(1));
    assert_eq!(map.get("b"), Some(2));
    assert_eq!(map.get("c"), None);
    assert_eq!(map.len(), 2);
}

#[test]
fn insert_returns_the_replaced_value() {
    let map = HashMap::new();
    assert_eq!(map.insert(1, "one"), None);
    assert_eq!(map.insert(1, "uno"), Some("one"));
    assert_eq!(map.get(&1), Some("uno"));
    assert_eq!(map.len(), 1);
}

#[test]
fn repeated_insert_is_idempotent() {
    let map = HashMap::new();
    map.insert("k", 7);
    map.insert("k", 7);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("k"), Some(7));
}

#[test]
fn get_or_insert_keeps_the_first_value() {
    let map = HashMap::new();
    assert_eq!(map.get_or_insert("k", 10), (10, false));
    assert_eq!(map.get_or_insert("k", 20), (10, true));
    assert_eq!(map.get("k"), Some(10));
}

#[test]
fn get_or_insert_with_skips_the_factory_when_present() {
    let map = HashMap::new();
    map.insert("k", 1);
    let (v, loaded) = map.get_or_insert_with("k", || unreachable!("key is present"));
    assert_eq!((v, loaded), (1, true));
}

#[test]
fn remove_returns_the_value_once() {
    let map = HashMap::new();
    map.insert("a", 1);
    map.insert("b", 2);
    assert_eq!(map.remove("a"), Some(1));
    assert_eq!(map.remove("a"), None);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("a"), None);
    assert_eq!(map.get("b"), Some(2));
}

#[test]
fn repeated_remove_is_idempotent() {
    let map = HashMap::new();
    map.insert("k", 1);
    map.remove("k");
    map.remove("k");
    assert_eq!(map.len(), 0);
    assert_eq!(map.get("k"), None);
}

#[test]
fn stored_none_is_distinguished_from_absent() {
    let map = HashMap::<&str, Option<u32>>::new();
    map.insert("k", None);
    assert_eq!(map.get("k"), Some(None));
    assert_eq!(map.get("missing"), None);
    assert_eq!(map.remove("k"), Some(None));
    assert_eq!(map.get("k"), None);
}

#[test]
fn lookups_accept_borrowed_keys() {
    let map = HashMap::<String, u32>::new();
    map.insert("alpha".to_string(), 1);
    assert_eq!(map.get("alpha"), Some(1));
    assert!(map.contains_key("alpha"));
    assert_eq!(map.remove("alpha"), Some(1));
}

#[test]
fn range_visits_every_key_once() {
    let map = HashMap::new();
    for i in 0..100u64 {
        map.insert(i, i * 3);
    }
    let mut seen = std::collections::HashSet::new();
    map.range(|k, v| {
        assert_eq!(*v, k * 3);
        assert!(seen.insert(*k), "key {k} visited twice");
        true
    });
    assert_eq!(seen.len(), 100);
}

#[test]
fn range_stops_when_the_callback_says_so() {
    let map = HashMap::new();
    for i in 0..100u64 {
        map.insert(i, i);
    }
    let mut seen = 0;
    map.range(|_, _| {
        seen += 1;
        seen < 10
    });
    assert_eq!(seen, 10);
}

#[test]
fn range_callback_may_reenter_the_map() {
    let map = HashMap::new();
    for i in 0..32u64 {
        map.insert(i, i);
    }
    map.range(|k, _| {
        // reads and writes from inside the traversal must not deadlock
        assert!(map.get(k).is_some());
        map.insert(1000 + k, 0);
        true
    });
    assert!(map.len() >= 32);
}

#[test]
fn snapshot_iterators_agree() {
    let map = HashMap::new();
    for i in 0..50u64 {
        map.insert(i, i + 1);
    }
    let pairs: Vec<_> = map.iter().collect();
    assert_eq!(pairs.len(), 50);
    assert_eq!(map.keys().count(), 50);
    let sum: u64 = map.values().sum();
    assert_eq!(sum, (1..=50).sum());
    for (k, v) in pairs {
        assert_eq!(v, k + 1);
    }
}

#[test]
fn clone_and_eq() {
    let map = HashMap::new();
    for i in 0..200u64 {
        map.insert(i, i * 2);
    }
    let copy = map.clone();
    assert_eq!(copy.len(), 200);
    assert_eq!(map, copy);

    copy.insert(0, 999);
    assert_ne!(map, copy);
}

#[test]
fn from_iterator_and_extend() {
    let map: HashMap<u64, u64> = (0..64).map(|i| (i, i)).collect();
    assert_eq!(map.len(), 64);

    let mut handle = &map;
    handle.extend((64..128).map(|i| (i, i)));
    assert_eq!(map.len(), 128);
    for i in 0..128 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn debug_formats_entries() {
    let map = HashMap::new();
    map.insert("k", 1);
    let rendered = format!("{map:?}");
    assert!(rendered.contains("\"k\": 1"), "got {rendered}");
}

#[test]
fn random_ops_match_a_reference_map() {
    let map = HashMap::new();
    let mut reference = std::collections::HashMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..10_000 {
        let key: u8 = rng.gen_range(0..64);
        match rng.gen_range(0..4) {
            0 => {
                let value: u32 = rng.gen();
                assert_eq!(map.insert(key, value), reference.insert(key, value));
            }
            1 => assert_eq!(map.remove(&key), reference.remove(&key)),
            2 => assert_eq!(map.get(&key), reference.get(&key).copied()),
            _ => {
                let value: u32 = rng.gen();
                let was_present = reference.contains_key(&key);
                let (actual, loaded) = map.get_or_insert(key, value);
                let expected = *reference.entry(key).or_insert(value);
                assert_eq!(actual, expected);
                assert_eq!(loaded, was_present);
            }
        }
        assert_eq!(map.len(), reference.len());
    }

    let mut pairs: Vec<_> = map.iter().collect();
    let mut expected: Vec<_> = reference.into_iter().collect();
    pairs.sort_unstable();
    expected.sort_unstable();
    assert_eq!(pairs, expected);
}
