use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::domain::{EventId, ItemId, Phase};
use crate::error::{StormsightError, is_retryable_error, is_retryable_status};
use crate::geometry::{BoundingBox, Footprint};

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Root catalog snapshot. Replace-only: a refresh builds a new value and the
/// session swaps the `Arc`, so consumers of the old snapshot are undisturbed.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub id: String,
    pub title: Option<String>,
    pub events: Vec<EventSummary>,
    pub fetched_at: DateTime<Utc>,
}

/// One `child` link of the root catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSummary {
    pub id: EventId,
    pub title: String,
    pub href: Url,
}

/// Collection document detail, known once the event has been resolved.
#[derive(Debug, Clone)]
pub struct EventDetail {
    pub id: EventId,
    pub title: String,
    pub description: Option<String>,
    pub extent: Option<BoundingBox>,
    pub interval: (Option<DateTime<Utc>>, Option<DateTime<Utc>>),
    pub phases: BTreeSet<Phase>,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    pub collection: EventId,
    pub footprint: Option<Footprint>,
    pub datetime: DateTime<Utc>,
    pub phase: Option<Phase>,
    pub assets: BTreeMap<String, Asset>,
    pub properties: serde_json::Map<String, Value>,
}

impl Item {
    /// Sensor name as the source tags it.
    pub fn sensor(&self) -> Option<&str> {
        self.property_str("vehicle_name")
            .or_else(|| self.property_str("constellation"))
    }

    pub fn cloud_cover(&self) -> Option<f64> {
        self.property_f64("eo:cloud_cover")
    }

    /// Ground sample distance in meters, preferring the panchromatic band.
    pub fn gsd(&self) -> Option<f64> {
        self.property_f64("pan_gsd")
            .or_else(|| self.property_f64("ms_gsd"))
            .or_else(|| self.property_f64("gsd"))
    }

    pub fn off_nadir(&self) -> Option<f64> {
        self.property_f64("view:off_nadir")
    }

    fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }

    pub fn from_document(
        value: &Value,
        event: &EventId,
        node: &str,
        base: Option<&Url>,
    ) -> Result<Item, StormsightError> {
        let parse_err = |message: String| StormsightError::Parse {
            node: node.to_string(),
            message,
        };
        let raw: RawItem = serde_json::from_value(value.clone())
            .map_err(|err| parse_err(format!("malformed item: {err}")))?;
        let id: ItemId = raw
            .id
            .parse()
            .map_err(|_| parse_err(format!("invalid item id `{}`", raw.id)))?;
        let collection = raw
            .collection
            .as_deref()
            .and_then(|value| value.parse::<EventId>().ok())
            .unwrap_or_else(|| event.clone());
        let datetime = raw
            .properties
            .get("datetime")
            .and_then(Value::as_str)
            .ok_or_else(|| parse_err("missing datetime property".to_string()))
            .and_then(|text| {
                DateTime::parse_from_rfc3339(text)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .map_err(|err| parse_err(format!("invalid datetime `{text}`: {err}")))
            })?;
        let phase = raw
            .properties
            .get("phase")
            .and_then(Value::as_str)
            .and_then(Phase::from_property);
        let footprint = match &raw.geometry {
            Some(geometry) if !geometry.is_null() => {
                Some(Footprint::from_geojson_value(geometry, node)?)
            }
            _ => raw
                .bbox
                .as_deref()
                .and_then(BoundingBox::from_slice)
                .map(Footprint::from_bbox),
        };
        let mut assets = BTreeMap::new();
        for (key, raw_asset) in raw.assets {
            match Asset::from_value(&raw_asset, base) {
                Some(asset) => {
                    assets.insert(key, asset);
                }
                None => {
                    tracing::debug!("dropping unusable asset `{key}` on {id}");
                }
            }
        }
        Ok(Item {
            id,
            collection,
            footprint,
            datetime,
            phase,
            assets,
            properties: raw.properties,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub href: Url,
    pub media_type: Option<String>,
    pub title: Option<String>,
    pub roles: Vec<String>,
    pub size: Option<u64>,
    pub checksum: Option<Checksum>,
}

impl Asset {
    fn from_value(value: &Value, base: Option<&Url>) -> Option<Asset> {
        let raw: RawAsset = serde_json::from_value(value.clone()).ok()?;
        let href = match Url::parse(&raw.href) {
            Ok(url) => url,
            Err(_) => base?.join(&raw.href).ok()?,
        };
        Some(Asset {
            href,
            media_type: raw.media_type,
            title: raw.title,
            roles: raw.roles,
            size: raw.size,
            checksum: raw
                .checksum
                .as_deref()
                .and_then(Checksum::from_property),
        })
    }
}

/// SHA-256 content checksum from the STAC file extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    hex: String,
}

impl Checksum {
    /// Accepts the `file:checksum` multihash form (`1220` prefix for
    /// SHA-256) and bare 64-char hex. Other algorithms yield `None`.
    pub fn from_property(value: &str) -> Option<Checksum> {
        let normalized = value.trim().to_lowercase();
        let hex = match normalized.len() {
            68 => normalized.strip_prefix("1220")?.to_string(),
            64 => normalized,
            _ => return None,
        };
        if hex.len() == 64 && hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            Some(Checksum { hex })
        } else {
            None
        }
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }
}

/// One item that failed to resolve; siblings are unaffected.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ItemIssue {
    pub node: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedItems {
    pub event: EventDetail,
    pub items: Vec<Item>,
    pub issues: Vec<ItemIssue>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    links: Vec<RawLink>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    #[serde(default)]
    rel: String,
    href: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCollection {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    extent: Option<RawExtent>,
    #[serde(default)]
    links: Vec<RawLink>,
}

#[derive(Debug, Deserialize)]
struct RawExtent {
    spatial: Option<RawSpatial>,
    temporal: Option<RawTemporal>,
}

#[derive(Debug, Deserialize)]
struct RawSpatial {
    #[serde(default)]
    bbox: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawTemporal {
    #[serde(default)]
    interval: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: String,
    collection: Option<String>,
    geometry: Option<Value>,
    bbox: Option<Vec<f64>>,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
    #[serde(default)]
    assets: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    href: String,
    #[serde(rename = "type")]
    media_type: Option<String>,
    title: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(rename = "file:size")]
    size: Option<u64>,
    #[serde(rename = "file:checksum")]
    checksum: Option<String>,
}

impl Catalog {
    pub fn from_document(value: &Value, root: &Url) -> Result<Catalog, StormsightError> {
        let raw: RawCatalog =
            serde_json::from_value(value.clone()).map_err(|err| StormsightError::Parse {
                node: root.to_string(),
                message: format!("malformed catalog: {err}"),
            })?;
        let mut events = Vec::new();
        for link in raw.links.iter().filter(|link| link.rel == "child") {
            let href = root.join(&link.href).map_err(|err| StormsightError::Parse {
                node: link.href.clone(),
                message: format!("unresolvable child href: {err}"),
            })?;
            let slug = event_slug(&href).ok_or_else(|| StormsightError::Parse {
                node: link.href.clone(),
                message: "child href has no usable path segment".to_string(),
            })?;
            let id: EventId = slug.parse().map_err(|_| StormsightError::Parse {
                node: link.href.clone(),
                message: format!("child href segment `{slug}` is not a valid event id"),
            })?;
            let title = link.title.clone().unwrap_or_else(|| slug.clone());
            events.push(EventSummary { id, title, href });
        }
        events.sort_by(|a, b| {
            (a.title.to_lowercase(), &a.id).cmp(&(b.title.to_lowercase(), &b.id))
        });
        Ok(Catalog {
            id: raw.id.unwrap_or_else(|| "catalog".to_string()),
            title: raw.title,
            events,
            fetched_at: Utc::now(),
        })
    }
}

/// Display identity for a `child` link without a title: the last path
/// segment that is not a document filename.
fn event_slug(href: &Url) -> Option<String> {
    href.path_segments()?
        .rev()
        .map(str::trim)
        .find(|segment| !segment.is_empty() && !segment.ends_with(".json"))
        .map(str::to_string)
}

fn parse_event_document(
    value: &Value,
    summary: &EventSummary,
) -> Result<(EventDetail, Vec<Url>), StormsightError> {
    let raw: RawCollection =
        serde_json::from_value(value.clone()).map_err(|err| StormsightError::Parse {
            node: summary.href.to_string(),
            message: format!("malformed collection: {err}"),
        })?;
    let id = raw
        .id
        .as_deref()
        .and_then(|value| value.parse::<EventId>().ok())
        .unwrap_or_else(|| summary.id.clone());
    let title = raw.title.unwrap_or_else(|| summary.title.clone());
    let extent = raw
        .extent
        .as_ref()
        .and_then(|extent| extent.spatial.as_ref())
        .and_then(|spatial| spatial.bbox.first())
        .and_then(|bbox| BoundingBox::from_slice(bbox));
    let interval = raw
        .extent
        .as_ref()
        .and_then(|extent| extent.temporal.as_ref())
        .and_then(|temporal| temporal.interval.first())
        .map(|interval| {
            let parse = |slot: Option<&String>| {
                slot.and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                    .map(|parsed| parsed.with_timezone(&Utc))
            };
            (
                parse(interval.first().and_then(Option::as_ref)),
                parse(interval.get(1).and_then(Option::as_ref)),
            )
        })
        .unwrap_or((None, None));
    let mut item_links = Vec::new();
    for link in raw.links.iter().filter(|link| link.rel == "item") {
        let href = summary
            .href
            .join(&link.href)
            .map_err(|err| StormsightError::Parse {
                node: link.href.clone(),
                message: format!("unresolvable item href: {err}"),
            })?;
        item_links.push(href);
    }
    let detail = EventDetail {
        id,
        title,
        description: raw.description,
        extent,
        interval,
        phases: BTreeSet::new(),
    };
    Ok((detail, item_links))
}

/// Resolve every item link of an event. A link that fails to fetch or
/// parse becomes an [`ItemIssue`] and its siblings are kept; the first
/// occurrence of a duplicated id wins.
fn collect_items<F>(
    detail: &mut EventDetail,
    item_links: Vec<Url>,
    mut fetch: F,
) -> (Vec<Item>, Vec<ItemIssue>)
where
    F: FnMut(&Url) -> Result<Value, StormsightError>,
{
    let mut items: Vec<Item> = Vec::new();
    let mut issues = Vec::new();
    let mut seen: BTreeSet<ItemId> = BTreeSet::new();
    for href in item_links {
        let outcome = fetch(&href).and_then(|document| {
            Item::from_document(&document, &detail.id, href.as_str(), Some(&href))
        });
        match outcome {
            Ok(item) => {
                if !seen.insert(item.id.clone()) {
                    tracing::debug!("duplicate item {} in {}", item.id, detail.id);
                    continue;
                }
                if let Some(phase) = item.phase {
                    detail.phases.insert(phase);
                }
                items.push(item);
            }
            Err(err) => {
                tracing::warn!("skipping item at {href}: {err}");
                issues.push(ItemIssue {
                    node: href.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    (items, issues)
}

pub trait CatalogClient: Send + Sync {
    fn fetch_root(&self, root: &Url) -> Result<Catalog, StormsightError>;
    fn fetch_event(&self, event: &EventSummary) -> Result<ResolvedItems, StormsightError>;
}

#[derive(Clone)]
pub struct StacHttpClient {
    client: Client,
}

impl StacHttpClient {
    pub fn new(timeout_secs: u64) -> Result<Self, StormsightError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("stormsight/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StormsightError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| StormsightError::CatalogHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn get_json(&self, url: &Url) -> Result<Value, StormsightError> {
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(StormsightError::CatalogStatus { status, message });
        }
        response.json().map_err(|err| StormsightError::Parse {
            node: url.to_string(),
            message: format!("invalid JSON: {err}"),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, StormsightError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS << attempt;
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS << attempt;
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(StormsightError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for StacHttpClient {
    fn fetch_root(&self, root: &Url) -> Result<Catalog, StormsightError> {
        let document = self.get_json(root)?;
        Catalog::from_document(&document, root)
    }

    fn fetch_event(&self, event: &EventSummary) -> Result<ResolvedItems, StormsightError> {
        let document = self.get_json(&event.href)?;
        let (mut detail, item_links) = parse_event_document(&document, event)?;
        let (items, issues) = collect_items(&mut detail, item_links, |href| self.get_json(href));
        Ok(ResolvedItems {
            event: detail,
            items,
            issues,
        })
    }
}

/// Session-scoped catalog cache. The snapshot is replaced wholesale on
/// refresh; resolved item sets are cached per event until then.
pub struct CatalogSession<C: CatalogClient> {
    client: C,
    root: Url,
    snapshot: RwLock<Option<Arc<Catalog>>>,
    items: Mutex<HashMap<EventId, Arc<ResolvedItems>>>,
}

impl<C: CatalogClient> CatalogSession<C> {
    pub fn new(client: C, root: Url) -> Self {
        Self {
            client,
            root,
            snapshot: RwLock::new(None),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub fn catalog(&self) -> Result<Arc<Catalog>, StormsightError> {
        if let Some(snapshot) = self.snapshot.read().unwrap().clone() {
            return Ok(snapshot);
        }
        let fetched = Arc::new(self.client.fetch_root(&self.root)?);
        let mut guard = self.snapshot.write().unwrap();
        Ok(Arc::clone(guard.get_or_insert(fetched)))
    }

    pub fn refresh(&self) -> Result<Arc<Catalog>, StormsightError> {
        let fetched = Arc::new(self.client.fetch_root(&self.root)?);
        // the swap and the clear must land together, or a resolve racing
        // this refresh could re-seed the cache from the old snapshot
        let mut items = self.items.lock().unwrap();
        *self.snapshot.write().unwrap() = Some(Arc::clone(&fetched));
        items.clear();
        Ok(fetched)
    }

    pub fn resolve_items(&self, id: &EventId) -> Result<Arc<ResolvedItems>, StormsightError> {
        if let Some(resolved) = self.items.lock().unwrap().get(id).cloned() {
            return Ok(resolved);
        }
        let catalog = self.catalog()?;
        let summary = catalog
            .events
            .iter()
            .find(|event| &event.id == id)
            .cloned()
            .ok_or_else(|| StormsightError::EventNotFound(id.to_string()))?;
        let resolved = Arc::new(self.client.fetch_event(&summary)?);

        let mut cache = self.items.lock().unwrap();
        let current = self.snapshot.read().unwrap().clone();
        if current.is_some_and(|current| Arc::ptr_eq(&current, &catalog)) {
            return Ok(Arc::clone(cache.entry(id.clone()).or_insert(resolved)));
        }
        // refreshed while we were fetching: the caller still gets its answer,
        // but items resolved against the old snapshot stay out of the cache
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn detail(id: &str) -> EventDetail {
        EventDetail {
            id: id.parse().unwrap(),
            title: id.to_string(),
            description: None,
            extent: None,
            interval: (None, None),
            phases: BTreeSet::new(),
        }
    }

    fn item_link(name: &str) -> Url {
        Url::parse(&format!("https://data.example.com/items/{name}")).unwrap()
    }

    #[test]
    fn collect_items_keeps_siblings_and_drops_duplicates() {
        let mut detail = detail("kahramanmaras");
        let links = vec![
            item_link("i1.json"),
            item_link("broken.json"),
            item_link("offline.json"),
            item_link("i1-again.json"),
            item_link("i2.json"),
        ];
        let fetch = |href: &Url| -> Result<Value, StormsightError> {
            let name = href.path_segments().unwrap().next_back().unwrap().to_string();
            match name.as_str() {
                "i1.json" => Ok(json!({
                    "id": "i1",
                    "properties": {"datetime": "2023-02-06T04:17:00Z", "phase": "post-event"},
                })),
                "broken.json" => Ok(json!({"id": "broken", "properties": {}})),
                "offline.json" => Err(StormsightError::CatalogStatus {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
                "i1-again.json" => Ok(json!({
                    "id": "i1",
                    "properties": {"datetime": "2023-02-07T00:00:00Z"},
                })),
                "i2.json" => Ok(json!({
                    "id": "i2",
                    "properties": {"datetime": "2023-02-05T10:00:00Z", "phase": "pre"},
                })),
                other => panic!("unexpected fetch of {other}"),
            }
        };

        let (items, issues) = collect_items(&mut detail, links, fetch);

        let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["i1", "i2"]);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].node.ends_with("broken.json"));
        assert!(issues[0].error.contains("datetime"));
        assert!(issues[1].node.ends_with("offline.json"));
        assert!(detail.phases.contains(&Phase::Pre));
        assert!(detail.phases.contains(&Phase::Post));
    }

    #[test]
    fn checksum_multihash_and_bare_hex() {
        let hex = "a".repeat(64);
        let multihash = format!("1220{hex}");
        assert_eq!(Checksum::from_property(&multihash).unwrap().as_hex(), hex);
        assert_eq!(Checksum::from_property(&hex).unwrap().as_hex(), hex);
        // md5 multihash prefix is not ours
        assert_eq!(Checksum::from_property(&format!("d500{hex}")), None);
        assert_eq!(Checksum::from_property("zz"), None);
    }

    #[test]
    fn event_slug_skips_document_names() {
        let url = Url::parse("https://data.example.com/events/kahramanmaras/collection.json")
            .unwrap();
        assert_eq!(event_slug(&url).as_deref(), Some("kahramanmaras"));

        let bare = Url::parse("https://data.example.com/events/izmir/").unwrap();
        assert_eq!(event_slug(&bare).as_deref(), Some("izmir"));
    }
}
