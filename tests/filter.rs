use std::collections::BTreeMap;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};

use stormsight::catalog::Item;
use stormsight::domain::{Phase, PhaseFilter};
use stormsight::error::StormsightError;
use stormsight::filter::{self, FilterCriteria};
use stormsight::geometry::{BoundingBox, Footprint, Region};

fn item(id: &str, day: u32, phase: Option<Phase>, bbox: Option<[f64; 4]>) -> Item {
    Item {
        id: id.parse().unwrap(),
        collection: "test-event".parse().unwrap(),
        footprint: bbox.map(|[w, s, e, n]| Footprint::from_bbox(BoundingBox::new(w, s, e, n))),
        datetime: Utc.with_ymd_and_hms(2023, 2, day, 12, 0, 0).unwrap(),
        phase,
        assets: BTreeMap::new(),
        properties: serde_json::Map::new(),
    }
}

#[test]
fn phase_filter_excludes_untagged_items() {
    let items = vec![
        item("pre-1", 1, Some(Phase::Pre), None),
        item("post-1", 7, Some(Phase::Post), None),
        item("untagged", 3, None, None),
    ];

    let criteria = FilterCriteria {
        phase: PhaseFilter::Post,
        ..Default::default()
    };
    let post = filter::apply(&items, &criteria).unwrap();
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].id.as_str(), "post-1");

    let any = filter::apply(&items, &FilterCriteria::default()).unwrap();
    assert_eq!(any.len(), 3);
}

#[test]
fn spatial_filter_is_exact_intersection() {
    // Thin diagonal footprint whose bbox covers the whole square.
    let geometry = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[
            [0.0, 0.0], [0.1, 0.0], [10.0, 9.9], [10.0, 10.0], [9.9, 10.0], [0.0, 0.1], [0.0, 0.0]
        ]]
    });
    let mut diagonal = item("diagonal", 1, None, None);
    diagonal.footprint = Some(Footprint::from_geojson_value(&geometry, "diagonal").unwrap());
    let items = vec![diagonal];

    let corner = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(0.5, 8.0, 1.5, 9.0))),
        ..Default::default()
    };
    assert!(filter::apply(&items, &corner).unwrap().is_empty());

    let on_diagonal = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(4.0, 4.0, 6.0, 6.0))),
        ..Default::default()
    };
    assert_eq!(filter::apply(&items, &on_diagonal).unwrap().len(), 1);
}

#[test]
fn missing_footprint_passes_spatial_filter() {
    let items = vec![
        item("no-footprint", 1, None, None),
        item("far-away", 2, None, Some([100.0, 50.0, 101.0, 51.0])),
    ];
    let criteria = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(0.0, 0.0, 1.0, 1.0))),
        ..Default::default()
    };
    let matched = filter::apply(&items, &criteria).unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id.as_str(), "no-footprint");
}

#[test]
fn degenerate_region_rejected_before_evaluation() {
    let criteria = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(5.0, 0.0, 1.0, 1.0))),
        ..Default::default()
    };
    assert_matches!(
        filter::apply(&[], &criteria),
        Err(StormsightError::InvalidCriteria(_))
    );
}

#[test]
fn output_order_is_time_then_id() {
    let items = vec![
        item("b-late", 9, None, None),
        item("z-early", 1, None, None),
        item("a-late", 9, None, None),
    ];
    let matched = filter::apply(&items, &FilterCriteria::default()).unwrap();
    let ids: Vec<&str> = matched.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, ["z-early", "a-late", "b-late"]);
}

#[test]
fn event_scope_excludes_other_collections() {
    let mut foreign = item("borrowed", 1, None, None);
    foreign.collection = "another-event".parse().unwrap();
    let items = vec![item("ours", 1, None, None), foreign];

    let criteria = FilterCriteria {
        event: Some("test-event".parse().unwrap()),
        ..Default::default()
    };
    let matched = filter::apply(&items, &criteria).unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id.as_str(), "ours");
}

#[test]
fn combined_predicates_all_apply() {
    let items = vec![
        item("post-in", 5, Some(Phase::Post), Some([0.0, 0.0, 2.0, 2.0])),
        item("post-out", 6, Some(Phase::Post), Some([50.0, 50.0, 52.0, 52.0])),
        item("pre-in", 4, Some(Phase::Pre), Some([0.0, 0.0, 2.0, 2.0])),
    ];
    let criteria = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(1.0, 1.0, 3.0, 3.0))),
        phase: PhaseFilter::Post,
        ..Default::default()
    };
    let matched = filter::apply(&items, &criteria).unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id.as_str(), "post-in");
}

#[test]
fn pre_phase_slice_of_a_mixed_event() {
    let items = vec![
        item("post-strike", 8, Some(Phase::Post), None),
        item("baseline-late", 4, Some(Phase::Pre), None),
        item("baseline-early", 2, Some(Phase::Pre), None),
    ];
    let criteria = FilterCriteria {
        event: Some("test-event".parse().unwrap()),
        phase: PhaseFilter::Pre,
        ..Default::default()
    };
    let matched = filter::apply(&items, &criteria).unwrap();
    let ids: Vec<&str> = matched.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, ["baseline-early", "baseline-late"]);
}

#[test]
fn same_criteria_twice_yields_identical_output() {
    let items = vec![
        item("c", 3, Some(Phase::Post), Some([0.0, 0.0, 2.0, 2.0])),
        item("a", 3, Some(Phase::Post), None),
        item("b", 1, Some(Phase::Pre), Some([0.0, 0.0, 2.0, 2.0])),
    ];
    let criteria = FilterCriteria {
        region: Some(Region::Bbox(BoundingBox::new(1.0, 1.0, 3.0, 3.0))),
        phase: PhaseFilter::Post,
        ..Default::default()
    };
    let run = || -> Vec<String> {
        filter::apply(&items, &criteria)
            .unwrap()
            .iter()
            .map(|item| item.id.to_string())
            .collect()
    };
    let first = run();
    assert_eq!(first, ["a", "c"]);
    assert_eq!(run(), first);
}
