use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use ott_enricher::domain::{Enrichment, TaxonId};
use ott_enricher::error::OttError;
use ott_enricher::store::TaxonStore;

fn sample_store() -> TaxonStore {
    let store = TaxonStore::open_in_memory().unwrap();
    store
        .bulk_insert([
            ("ott1", None),
            ("ott2", Some("ott1")),
            ("ott3", Some("ott1")),
            ("ott4", Some("ott3")),
        ])
        .unwrap();
    store
}

fn enriched(name: &str) -> Enrichment {
    Enrichment {
        name: name.to_string(),
        extant: Some(true),
        other_names: Vec::new(),
        description: None,
    }
}

#[test]
fn fresh_store_is_not_loaded() {
    let store = TaxonStore::open_in_memory().unwrap();
    assert!(!store.exists().unwrap());
    assert_eq!(store.count_unenriched().unwrap(), 0);
    assert!(store.iter_unenriched().next().is_none());
}

#[test]
fn bulk_insert_tolerates_any_order() {
    let store = TaxonStore::open_in_memory().unwrap();
    // children before their parent
    let inserted = store
        .bulk_insert([("ott4", Some("ott3")), ("ott3", Some("ott1")), ("ott1", None)])
        .unwrap();
    assert_eq!(inserted, 3);
    assert!(store.exists().unwrap());
    assert!(store.loaded_at().unwrap().is_some());
}

#[test]
fn bulk_insert_is_all_or_nothing() {
    let store = TaxonStore::open_in_memory().unwrap();
    let err = store
        .bulk_insert([("ott1", None), ("ott2", Some("ott1")), ("ott1", Some("ott2"))])
        .unwrap_err();
    assert_matches!(err, OttError::Store(_));
    assert_eq!(store.count().unwrap(), 0);
    assert!(!store.exists().unwrap());
}

#[test]
fn each_enrichment_removes_exactly_one_pending_row() {
    let store = sample_store();
    let mut pending = store.count_unenriched().unwrap();
    assert_eq!(pending, 4);
    for (index, id) in ["ott1", "ott2", "ott3", "ott4"].into_iter().enumerate() {
        let enrichment = if index % 2 == 0 {
            Enrichment::placeholder()
        } else {
            enriched(id)
        };
        store.set_enrichment(&TaxonId::from(id), &enrichment).unwrap();
        let now = store.count_unenriched().unwrap();
        assert_eq!(now, pending - 1);
        pending = now;
    }
    assert_eq!(pending, 0);
}

#[test]
fn iteration_sees_live_state() {
    let store = sample_store();
    let mut seen = Vec::new();
    let mut ids = store.iter_unenriched_paged(1);

    let first = ids.next().unwrap().unwrap();
    seen.push(first.clone());
    store.set_enrichment(&first, &enriched("one")).unwrap();
    // enriched ahead of the cursor, so it must not come back
    store
        .set_enrichment(&TaxonId::from("ott4"), &enriched("four"))
        .unwrap();

    for id in ids {
        let id = id.unwrap();
        store.set_enrichment(&id, &enriched(id.as_str())).unwrap();
        seen.push(id);
    }
    let seen: Vec<_> = seen.iter().map(TaxonId::as_str).collect();
    assert_eq!(seen, vec!["ott1", "ott2", "ott3"]);
}

#[test]
fn set_enrichment_rejects_unknown_taxon() {
    let store = sample_store();
    let err = store
        .set_enrichment(&TaxonId::from("ott99"), &Enrichment::placeholder())
        .unwrap_err();
    assert_matches!(err, OttError::Store(_));
}

#[test]
fn uncommitted_writes_are_lost_on_crash() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("taxa.db")).unwrap();
    {
        let store = TaxonStore::open(&path).unwrap();
        store
            .bulk_insert([("ott1", None), ("ott2", Some("ott1")), ("ott3", Some("ott1"))])
            .unwrap();
        store
            .set_enrichment(&TaxonId::from("ott1"), &enriched("one"))
            .unwrap();
        store.commit().unwrap();
        store
            .set_enrichment(&TaxonId::from("ott2"), &enriched("two"))
            .unwrap();
        // dropped without a commit
    }

    let store = TaxonStore::open(&path).unwrap();
    assert!(store.exists().unwrap());
    assert_eq!(store.count_unenriched().unwrap(), 2);
    let ott1 = store.get(&TaxonId::from("ott1")).unwrap().unwrap();
    assert_eq!(ott1.enrichment, Some(enriched("one")));
    assert!(store.get(&TaxonId::from("ott2")).unwrap().unwrap().enrichment.is_none());
}

#[test]
fn names_are_deduplicated_and_tracked() {
    let store = TaxonStore::open_in_memory().unwrap();
    assert_eq!(store.insert_names(["Foo", "Bar", "Foo"]).unwrap(), 2);
    assert_eq!(store.insert_names(["Bar", "Baz"]).unwrap(), 1);
    assert_eq!(store.count_unresolved_names().unwrap(), 3);
    assert_eq!(
        store.unresolved_names(None, 2).unwrap(),
        vec!["Bar".to_string(), "Baz".to_string()]
    );
    assert_eq!(store.unresolved_names(Some("Baz"), 2).unwrap(), vec!["Foo".to_string()]);

    let stats = store.name_stats().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.pending, 3);
}

#[test]
fn empty_id_is_still_iterated() {
    let store = TaxonStore::open_in_memory().unwrap();
    store.bulk_insert([("", Some("ott2")), ("ott2", None)]).unwrap();

    let ids: Vec<TaxonId> = store.iter_unenriched().map(Result::unwrap).collect();
    assert_eq!(ids, vec![TaxonId::from(""), TaxonId::from("ott2")]);

    for id in &ids {
        store.set_enrichment(id, &Enrichment::placeholder()).unwrap();
    }
    store.commit().unwrap();
    assert_eq!(store.count_unenriched().unwrap(), 0);
}
