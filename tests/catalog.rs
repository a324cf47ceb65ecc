use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use assert_matches::assert_matches;
use chrono::Utc;
use url::Url;

use stormsight::catalog::{
    Catalog, CatalogClient, CatalogSession, EventDetail, EventSummary, Item, ResolvedItems,
};
use stormsight::domain::{EventId, Phase};
use stormsight::error::StormsightError;

fn summary(id: &str) -> EventSummary {
    EventSummary {
        id: id.parse().unwrap(),
        title: format!("{id} event"),
        href: Url::parse(&format!("https://catalog.test/events/{id}/collection.json")).unwrap(),
    }
}

fn resolved(event: &EventSummary) -> ResolvedItems {
    ResolvedItems {
        event: EventDetail {
            id: event.id.clone(),
            title: event.title.clone(),
            description: None,
            extent: None,
            interval: (None, None),
            phases: BTreeSet::new(),
        },
        items: vec![],
        issues: vec![],
    }
}

#[derive(Clone, Default)]
struct Counters {
    root: Arc<Mutex<usize>>,
    event: Arc<Mutex<usize>>,
}

struct MockCatalog {
    counters: Counters,
}

impl CatalogClient for MockCatalog {
    fn fetch_root(&self, _root: &Url) -> Result<Catalog, StormsightError> {
        *self.counters.root.lock().unwrap() += 1;
        Ok(Catalog {
            id: "opendata".to_string(),
            title: Some("Open Data".to_string()),
            events: vec![summary("hurricane-ian"), summary("kahramanmaras")],
            fetched_at: Utc::now(),
        })
    }

    fn fetch_event(&self, event: &EventSummary) -> Result<ResolvedItems, StormsightError> {
        *self.counters.event.lock().unwrap() += 1;
        Ok(resolved(event))
    }
}

/// Client whose first event fetch signals `entered` and then parks on the
/// gate, so a refresh can land in the middle of a resolve.
struct GatedCatalog {
    counters: Counters,
    entered: Sender<()>,
    gate: Mutex<Receiver<()>>,
}

impl CatalogClient for GatedCatalog {
    fn fetch_root(&self, _root: &Url) -> Result<Catalog, StormsightError> {
        *self.counters.root.lock().unwrap() += 1;
        Ok(Catalog {
            id: "opendata".to_string(),
            title: None,
            events: vec![summary("hurricane-ian")],
            fetched_at: Utc::now(),
        })
    }

    fn fetch_event(&self, event: &EventSummary) -> Result<ResolvedItems, StormsightError> {
        let first = {
            let mut calls = self.counters.event.lock().unwrap();
            *calls += 1;
            *calls == 1
        };
        if first {
            let _ = self.entered.send(());
            let _ = self.gate.lock().unwrap().recv();
        }
        Ok(resolved(event))
    }
}

fn session() -> (CatalogSession<MockCatalog>, Counters) {
    let counters = Counters::default();
    let session = CatalogSession::new(
        MockCatalog {
            counters: counters.clone(),
        },
        Url::parse("https://catalog.test/catalog.json").unwrap(),
    );
    (session, counters)
}

#[test]
fn root_snapshot_is_fetched_once() {
    let (session, counters) = session();
    let first = session.catalog().unwrap();
    let second = session.catalog().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.events.len(), 2);
    assert_eq!(*counters.root.lock().unwrap(), 1);
}

#[test]
fn refresh_swaps_the_snapshot_and_drops_cached_items() {
    let (session, counters) = session();
    let event: EventId = "hurricane-ian".parse().unwrap();

    let before = session.catalog().unwrap();
    session.resolve_items(&event).unwrap();
    session.resolve_items(&event).unwrap();

    let after = session.refresh().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    // old snapshot is still usable by whoever holds it
    assert_eq!(before.id, after.id);

    session.resolve_items(&event).unwrap();
    assert_eq!(*counters.root.lock().unwrap(), 2);
    assert_eq!(*counters.event.lock().unwrap(), 2);
}

#[test]
fn resolve_overlapped_by_a_refresh_is_not_cached() {
    let counters = Counters::default();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let session = CatalogSession::new(
        GatedCatalog {
            counters: counters.clone(),
            entered: entered_tx,
            gate: Mutex::new(gate_rx),
        },
        Url::parse("https://catalog.test/catalog.json").unwrap(),
    );
    let event: EventId = "hurricane-ian".parse().unwrap();

    thread::scope(|scope| {
        let resolver = scope.spawn(|| session.resolve_items(&event));
        // the resolve is parked inside the client, holding the old snapshot
        entered_rx.recv().unwrap();
        session.refresh().unwrap();
        gate_tx.send(()).unwrap();

        // the overlapped caller still gets its answer
        let stale = resolver.join().unwrap().unwrap();
        assert_eq!(stale.event.id, event);
    });

    // but the answer never reached the cache: the next resolve fetches anew
    session.resolve_items(&event).unwrap();
    assert_eq!(*counters.event.lock().unwrap(), 2);
}

#[test]
fn resolved_items_are_cached_per_event() {
    let (session, counters) = session();
    let event: EventId = "kahramanmaras".parse().unwrap();
    let first = session.resolve_items(&event).unwrap();
    let second = session.resolve_items(&event).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*counters.event.lock().unwrap(), 1);
}

#[test]
fn unknown_event_is_a_not_found_error() {
    let (session, _counters) = session();
    let missing: EventId = "no-such-event".parse().unwrap();
    assert_matches!(
        session.resolve_items(&missing),
        Err(StormsightError::EventNotFound(_))
    );
}

#[test]
fn catalog_document_maps_child_links_to_events() {
    let root = Url::parse("https://catalog.test/catalog.json").unwrap();
    let document = serde_json::json!({
        "type": "Catalog",
        "id": "maxar-opendata",
        "title": "Maxar Open Data",
        "links": [
            {"rel": "self", "href": "catalog.json"},
            {"rel": "child", "href": "events/Kahramanmaras-turkey-earthquake-23/collection.json", "title": "Turkey Earthquake 2023"},
            {"rel": "child", "href": "events/cyclone-mocha/collection.json"}
        ]
    });

    let catalog = Catalog::from_document(&document, &root).unwrap();
    assert_eq!(catalog.id, "maxar-opendata");
    assert_eq!(catalog.events.len(), 2);
    // sorted by title, and the untitled child falls back to its slug
    assert_eq!(catalog.events[0].title, "cyclone-mocha");
    assert_eq!(catalog.events[0].id.as_str(), "cyclone-mocha");
    assert_eq!(catalog.events[1].title, "Turkey Earthquake 2023");
    assert_eq!(
        catalog.events[1].href.as_str(),
        "https://catalog.test/events/Kahramanmaras-turkey-earthquake-23/collection.json"
    );
}

#[test]
fn item_document_parses_phase_footprint_and_assets() {
    let base = Url::parse("https://catalog.test/events/mocha/items/scene-1.json").unwrap();
    let event: EventId = "cyclone-mocha".parse().unwrap();
    let document = serde_json::json!({
        "type": "Feature",
        "id": "10300100DA054000-visual",
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[92.0, 20.0], [93.0, 20.0], [93.0, 21.0], [92.0, 21.0], [92.0, 20.0]]]
        },
        "properties": {
            "datetime": "2023-05-15T04:30:00Z",
            "phase": "post-event",
            "eo:cloud_cover": 12.5,
            "vehicle_name": "WV03",
            "pan_gsd": 0.35
        },
        "assets": {
            "visual": {
                "href": "../imagery/visual.tif",
                "type": "image/tiff; application=geotiff; profile=cloud-optimized",
                "roles": ["visual"],
                "file:size": 123456789u64,
                "file:checksum": format!("1220{}", "ab".repeat(32))
            },
            "broken": {"title": "no href here"}
        }
    });

    let item = Item::from_document(&document, &event, "scene-1", Some(&base)).unwrap();
    assert_eq!(item.id.as_str(), "10300100DA054000-visual");
    assert_eq!(item.phase, Some(Phase::Post));
    assert_eq!(item.sensor(), Some("WV03"));
    assert_eq!(item.cloud_cover(), Some(12.5));
    assert_eq!(item.gsd(), Some(0.35));
    assert!(item.footprint.is_some());

    // the asset without an href was dropped, the relative href was resolved
    assert_eq!(item.assets.len(), 1);
    let visual = &item.assets["visual"];
    assert_eq!(
        visual.href.as_str(),
        "https://catalog.test/events/mocha/imagery/visual.tif"
    );
    assert_eq!(visual.size, Some(123456789));
    assert_eq!(visual.checksum.as_ref().unwrap().as_hex(), "ab".repeat(32));
}

#[test]
fn item_document_without_datetime_is_rejected() {
    let event: EventId = "cyclone-mocha".parse().unwrap();
    let document = serde_json::json!({
        "type": "Feature",
        "id": "scene-2",
        "properties": {},
        "assets": {}
    });
    assert_matches!(
        Item::from_document(&document, &event, "scene-2", None),
        Err(StormsightError::Parse { node, .. }) if node == "scene-2"
    );
}

#[test]
fn item_bbox_stands_in_for_missing_geometry() {
    let event: EventId = "cyclone-mocha".parse().unwrap();
    let document = serde_json::json!({
        "type": "Feature",
        "id": "scene-3",
        "geometry": null,
        "bbox": [92.0, 20.0, 93.0, 21.0],
        "properties": {"datetime": "2023-05-15T04:30:00Z"},
        "assets": {}
    });
    let item = Item::from_document(&document, &event, "scene-3", None).unwrap();
    let footprint = item.footprint.unwrap();
    assert_eq!(footprint.bbox().to_array(), [92.0, 20.0, 93.0, 21.0]);
}
