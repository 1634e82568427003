use clipcapsule::{ClipOutcome, HistoryEngine, HistoryStore, SqliteStore};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;

fn contents<S: HistoryStore>(engine: &HistoryEngine<S>) -> Vec<String> {
    engine.entries().unwrap().into_iter().map(|e| e.content).collect()
}

fn assert_invariants(store: &SqliteStore) {
    let entries = store.fetch_all_ordered().unwrap();
    for (index, entry) in entries.iter().enumerate() {
        assert_eq!(entry.position, index as i64);
        assert!(!entry.content.is_empty());
    }
    let unique: HashSet<&str> = entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(unique.len(), entries.len());
}

#[test]
fn file_backed_scenario_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("cliphistory.db");

    {
        let mut engine = HistoryEngine::new(SqliteStore::open(&path).unwrap());
        assert_eq!(engine.on_new_clip("alpha").unwrap(), ClipOutcome::Stored);
        assert_eq!(engine.on_new_clip("beta").unwrap(), ClipOutcome::Stored);
        assert_eq!(engine.on_new_clip("alpha").unwrap(), ClipOutcome::Stored);
        assert_eq!(contents(&engine), vec!["alpha", "beta"]);
    }

    let mut engine = HistoryEngine::new(SqliteStore::open(&path).unwrap());
    assert_eq!(contents(&engine), vec!["alpha", "beta"]);
    assert_eq!(engine.on_select(2).unwrap().as_deref(), Some("beta"));
    assert_eq!(contents(&engine), vec!["beta", "alpha"]);
    assert_eq!(engine.store().fetch_at_position(1).unwrap().content, "alpha");
    assert!(engine.store().fetch_at_position(2).unwrap_err().is_not_found());
}

#[test]
fn entries_past_slot_nine_stay_stored() {
    let mut engine = HistoryEngine::new(SqliteStore::open_in_memory().unwrap());
    for i in 0..12 {
        engine.on_new_clip(&format!("clip {i}")).unwrap();
    }
    assert_eq!(engine.entries().unwrap().len(), 12);
    assert_eq!(engine.on_select(9).unwrap().as_deref(), Some("clip 3"));
    assert_eq!(engine.on_select(10).unwrap(), None);

    // The oldest entry resurfaces once it is copied again.
    engine.on_new_clip("clip 0").unwrap();
    assert_eq!(contents(&engine)[..3], ["clip 0", "clip 3", "clip 11"]);
    assert_eq!(engine.entries().unwrap().len(), 12);
}

#[derive(Debug, Clone)]
enum Op {
    Clip(String),
    Select(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop::sample::select(vec!["", "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"])
            .prop_map(|s| Op::Clip(s.to_string())),
        1 => (0u8..12).prop_map(Op::Select),
    ]
}

proptest! {
    #[test]
    fn invariants_hold_after_any_sequence(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut engine = HistoryEngine::new(SqliteStore::open_in_memory().unwrap());
        let mut model: Vec<String> = Vec::new();
        for op in ops {
            match op {
                Op::Clip(content) => {
                    engine.on_new_clip(&content).unwrap();
                    if !content.is_empty() {
                        model.retain(|existing| existing != &content);
                        model.insert(0, content);
                    }
                }
                Op::Select(slot) => {
                    let selected = engine.on_select(slot).unwrap();
                    let index = usize::from(slot).wrapping_sub(1);
                    if (1..=9).contains(&slot) && index < model.len() {
                        let chosen = model.remove(index);
                        prop_assert_eq!(selected.as_deref(), Some(chosen.as_str()));
                        model.insert(0, chosen);
                    } else {
                        prop_assert_eq!(selected, None);
                    }
                }
            }
            assert_invariants(engine.store());
        }
        prop_assert_eq!(contents(&engine), model);
    }

    #[test]
    fn replace_all_round_trips(list in prop::collection::hash_set("[a-z ]{1,12}", 0..15)) {
        let list: Vec<String> = list.into_iter().collect();
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.replace_all(&list).unwrap();
        let fetched: Vec<String> = store.fetch_all_ordered().unwrap().into_iter().map(|e| e.content).collect();
        prop_assert_eq!(fetched, list);
    }
}
