use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use url::Url;

use crate::assets::{self, AssetProber, AssetResolver};
use crate::catalog::{CatalogClient, CatalogSession, Item};
use crate::domain::{AssetRole, EventId, ItemId, PhaseFilter};
use crate::download::{
    AssetFetcher, DownloadManager, DownloadRequest, TaskEvent, TaskId, TaskState,
};
use crate::error::StormsightError;
use crate::filter::{self, FilterCriteria};
use crate::geometry::Region;
use crate::preview::{PreviewAdapter, RangeClient, TiledHandle};
use crate::selection::SelectionModel;
use crate::store::Store;

const PROGRESS_STEP: u64 = 8 * 1024 * 1024;
const EVENT_POLL: Duration = Duration::from_millis(500);
/// A transfer that produces no event at all for this long is treated as
/// wedged; the read side has no whole-request timeout.
const STALL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsResult {
    pub catalog_id: String,
    pub catalog_title: Option<String>,
    pub fetched_at: String,
    pub events: Vec<EventRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub event: EventId,
    pub phase: PhaseFilter,
    pub region: Option<Region>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub event: String,
    pub title: String,
    pub description: Option<String>,
    pub total_items: usize,
    pub items: Vec<ItemRow>,
    pub footprints: Vec<FootprintRow>,
    pub issues: Vec<crate::catalog::ItemIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemRow {
    pub id: String,
    pub datetime: String,
    pub phase: Option<String>,
    pub sensor: Option<String>,
    pub cloud_cover: Option<f64>,
    pub gsd: Option<f64>,
    pub off_nadir: Option<f64>,
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FootprintRow {
    pub id: String,
    pub footprint: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub item: String,
    pub role: String,
    pub url: String,
    pub media_type: String,
    pub byte_size: Option<u64>,
    pub supports_range: bool,
    pub expires_at: Option<String>,
    pub levels: Vec<LevelInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelInfo {
    pub width: u64,
    pub height: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_across: u32,
    pub tiles_down: u32,
    pub compression: u16,
}

#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub event: EventId,
    /// Explicit item ids; empty means everything the filters match.
    pub items: Vec<ItemId>,
    pub role: AssetRole,
    pub phase: PhaseFilter,
    pub region: Option<Region>,
    pub dest_dir: Option<Utf8PathBuf>,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub event: String,
    pub outcomes: Vec<DownloadOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub item: String,
    pub role: String,
    pub destination: Option<String>,
    pub status: String,
    pub bytes: u64,
    pub verified: bool,
    pub error: Option<String>,
}

pub struct App<C, P, R, F>
where
    C: CatalogClient,
    P: AssetProber,
    R: RangeClient,
    F: AssetFetcher + 'static,
{
    session: CatalogSession<C>,
    resolver: AssetResolver<P>,
    preview: PreviewAdapter<R>,
    downloads: DownloadManager<F>,
    selection: SelectionModel,
    store: Store,
}

impl<C, P, R, F> App<C, P, R, F>
where
    C: CatalogClient,
    P: AssetProber,
    R: RangeClient,
    F: AssetFetcher + 'static,
{
    pub fn new(
        session: CatalogSession<C>,
        resolver: AssetResolver<P>,
        preview: PreviewAdapter<R>,
        downloads: DownloadManager<F>,
        store: Store,
    ) -> Self {
        Self {
            session,
            resolver,
            preview,
            downloads,
            selection: SelectionModel::new(),
            store,
        }
    }

    /// Shared selection over the most recent search results.
    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    pub fn events(
        &self,
        refresh: bool,
        sink: &dyn ProgressSink,
    ) -> Result<EventsResult, StormsightError> {
        sink.event(ProgressEvent {
            message: "phase=Catalog; loading event index".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let catalog = if refresh {
            self.session.refresh()?
        } else {
            self.session.catalog()?
        };
        sink.event(ProgressEvent {
            message: format!(
                "catalog.response latency_ms={}",
                start.elapsed().as_millis()
            ),
            elapsed: None,
        });
        Ok(EventsResult {
            catalog_id: catalog.id.clone(),
            catalog_title: catalog.title.clone(),
            fetched_at: catalog.fetched_at.to_rfc3339(),
            events: catalog
                .events
                .iter()
                .map(|event| EventRow {
                    id: event.id.to_string(),
                    title: event.title.clone(),
                })
                .collect(),
        })
    }

    /// Resolves an event's items, filters them, and replaces the selection
    /// universe with the matching ids.
    pub fn search(
        &self,
        query: SearchQuery,
        sink: &dyn ProgressSink,
    ) -> Result<SearchResult, StormsightError> {
        let criteria = FilterCriteria {
            region: query.region,
            event: None,
            phase: query.phase,
        };
        criteria.validate()?;

        sink.event(ProgressEvent {
            message: format!("phase=Catalog; resolving {}", query.event),
            elapsed: None,
        });
        let start = Instant::now();
        let resolved = self.session.resolve_items(&query.event)?;
        sink.event(ProgressEvent {
            message: format!(
                "catalog.response latency_ms={}",
                start.elapsed().as_millis()
            ),
            elapsed: None,
        });

        let matched = filter::apply(&resolved.items, &criteria)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Filter; {} of {} items match",
                matched.len(),
                resolved.items.len()
            ),
            elapsed: None,
        });
        self.selection
            .set_universe(matched.iter().map(|item| item.id.clone()));

        let footprints = matched
            .iter()
            .filter_map(|item| {
                item.footprint.as_ref().map(|footprint| FootprintRow {
                    id: item.id.to_string(),
                    footprint: footprint.to_geojson(),
                })
            })
            .collect();
        Ok(SearchResult {
            event: resolved.event.id.to_string(),
            title: resolved.event.title.clone(),
            description: resolved.event.description.clone(),
            total_items: resolved.items.len(),
            items: matched.iter().map(item_row).collect(),
            footprints,
            issues: resolved.issues.clone(),
        })
    }

    /// Resolves the requested role, validates reachability, and reads the
    /// tile structure without downloading the raster.
    pub fn probe(
        &self,
        event: &EventId,
        item_id: &ItemId,
        role: &AssetRole,
        sink: &dyn ProgressSink,
    ) -> Result<ProbeResult, StormsightError> {
        let resolved = self.session.resolve_items(event)?;
        let item = resolved
            .items
            .iter()
            .find(|item| &item.id == item_id)
            .ok_or_else(|| StormsightError::ItemNotFound(item_id.to_string()))?;
        let asset = assets::resolve(item, role)?;
        sink.event(ProgressEvent {
            message: format!("phase=Probe; {}", asset.href),
            elapsed: None,
        });
        let metadata = self.resolver.validate(asset)?;
        let handle = self.preview.open(asset)?;
        Ok(ProbeResult {
            item: item_id.to_string(),
            role: role.to_string(),
            url: asset.href.to_string(),
            media_type: metadata.media_type,
            byte_size: metadata.byte_size,
            supports_range: metadata.supports_range,
            expires_at: handle.expires_at().map(|instant| instant.to_rfc3339()),
            levels: handle.levels().iter().map(level_info).collect(),
        })
    }

    /// Tiled read access for a host rendering engine.
    pub fn open_preview(
        &self,
        event: &EventId,
        item_id: &ItemId,
        role: &AssetRole,
    ) -> Result<TiledHandle<R>, StormsightError> {
        let resolved = self.session.resolve_items(event)?;
        let item = resolved
            .items
            .iter()
            .find(|item| &item.id == item_id)
            .ok_or_else(|| StormsightError::ItemNotFound(item_id.to_string()))?;
        let asset = assets::resolve(item, role)?;
        self.preview.open(asset)
    }

    /// Downloads the named items, or everything the filters match when no
    /// ids are given. Per-item failures are collected, not fatal.
    pub fn download(
        &self,
        spec: DownloadSpec,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, StormsightError> {
        let criteria = FilterCriteria {
            region: spec.region.clone(),
            event: None,
            phase: spec.phase,
        };
        criteria.validate()?;
        let resolved = self.session.resolve_items(&spec.event)?;

        let mut targets: Vec<Item> = Vec::new();
        if spec.items.is_empty() {
            targets = filter::apply(&resolved.items, &criteria)?;
        } else {
            for wanted in &spec.items {
                match resolved.items.iter().find(|item| &item.id == wanted) {
                    Some(item) => targets.push(item.clone()),
                    None => {
                        return Err(StormsightError::ItemNotFound(wanted.to_string()));
                    }
                }
            }
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Filter; {} of {} items queued for download",
                targets.len(),
                resolved.items.len()
            ),
            elapsed: None,
        });

        let dest_dir = spec
            .dest_dir
            .clone()
            .unwrap_or_else(|| self.store.download_dir(&spec.event));
        let start = Instant::now();
        let receiver = self.downloads.subscribe();

        let mut outcomes: Vec<DownloadOutcome> = Vec::new();
        let mut enqueued: Vec<(TaskId, usize)> = Vec::new();
        let mut task_items: HashMap<TaskId, ItemId> = HashMap::new();
        let mut used_names: BTreeSet<String> = BTreeSet::new();
        for item in &targets {
            let asset = match assets::resolve(item, &spec.role) {
                Ok(asset) => asset,
                Err(err) => {
                    outcomes.push(DownloadOutcome {
                        item: item.id.to_string(),
                        role: spec.role.to_string(),
                        destination: None,
                        status: "failed".to_string(),
                        bytes: 0,
                        verified: false,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };
            let mut filename =
                filename_from_url(&asset.href).unwrap_or_else(|| format!("{}.tif", item.id));
            if !used_names.insert(filename.clone()) {
                filename = format!("{}-{filename}", item.id);
                used_names.insert(filename.clone());
            }
            let destination = dest_dir.join(&filename);

            if !spec.force && Store::is_complete(&destination) {
                let record = Store::load_record(&destination)?;
                sink.event(ProgressEvent {
                    message: format!("phase=Store; {} already downloaded", item.id),
                    elapsed: None,
                });
                outcomes.push(DownloadOutcome {
                    item: item.id.to_string(),
                    role: spec.role.to_string(),
                    destination: Some(destination.to_string()),
                    status: "cache-hit".to_string(),
                    bytes: record.as_ref().map(|record| record.bytes).unwrap_or(0),
                    verified: record.map(|record| record.verified).unwrap_or(false),
                    error: None,
                });
                continue;
            }

            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {} -> {}", item.id, asset.href),
                elapsed: None,
            });
            let id = self.downloads.enqueue(DownloadRequest {
                event: spec.event.clone(),
                item: item.id.clone(),
                role: spec.role.clone(),
                url: asset.href.clone(),
                destination: destination.clone(),
                total: asset.size,
                checksum: asset.checksum.clone(),
            });
            task_items.insert(id, item.id.clone());
            enqueued.push((id, outcomes.len()));
            outcomes.push(DownloadOutcome {
                item: item.id.to_string(),
                role: spec.role.to_string(),
                destination: Some(destination.to_string()),
                status: "pending".to_string(),
                bytes: 0,
                verified: false,
                error: None,
            });
        }

        self.drain_events(&receiver, &task_items, start, sink)?;

        for (task_id, index) in enqueued {
            let snapshot = self.downloads.acknowledge(task_id)?;
            let outcome = &mut outcomes[index];
            outcome.bytes = snapshot.bytes;
            match snapshot.state {
                TaskState::Completed => {
                    outcome.status = "completed".to_string();
                    outcome.verified = Store::load_record(&snapshot.destination)?
                        .map(|record| record.verified)
                        .unwrap_or(false);
                }
                state => {
                    outcome.status = state.to_string();
                    outcome.error = snapshot.error;
                }
            }
        }

        Ok(DownloadResult {
            event: spec.event.to_string(),
            outcomes,
        })
    }

    fn drain_events(
        &self,
        receiver: &std::sync::mpsc::Receiver<TaskEvent>,
        task_items: &HashMap<TaskId, ItemId>,
        start: Instant,
        sink: &dyn ProgressSink,
    ) -> Result<(), StormsightError> {
        let mut pending: BTreeSet<TaskId> = task_items.keys().copied().collect();
        let mut last_reported: HashMap<TaskId, u64> = HashMap::new();
        let mut last_event = Instant::now();
        while !pending.is_empty() {
            let event = match receiver.recv_timeout(EVENT_POLL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    if last_event.elapsed() >= Duration::from_secs(STALL_SECS) {
                        return Err(StormsightError::DownloadStalled(STALL_SECS));
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            last_event = Instant::now();
            let Some(item) = task_items.get(&event.id()) else {
                continue;
            };
            match event {
                TaskEvent::Progress { id, bytes, total } => {
                    let reported = last_reported.entry(id).or_insert(0);
                    if bytes < *reported {
                        // the transfer restarted below the last report
                        *reported = 0;
                    }
                    if bytes - *reported >= PROGRESS_STEP {
                        *reported = bytes;
                        sink.event(ProgressEvent {
                            message: transfer_message(item, bytes, total),
                            elapsed: None,
                        });
                    }
                }
                TaskEvent::ResumeDowngraded { reason, .. } => {
                    sink.event(ProgressEvent {
                        message: format!("phase=Transfer; {item} restarting from zero: {reason}"),
                        elapsed: None,
                    });
                }
                TaskEvent::RetryScheduled {
                    attempt, delay_ms, ..
                } => {
                    sink.event(ProgressEvent {
                        message: format!("phase=Transfer; {item} retry {attempt} in {delay_ms} ms"),
                        elapsed: None,
                    });
                }
                TaskEvent::IntegrityRetry { .. } => {
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Verify; {item} checksum mismatch, downloading again"
                        ),
                        elapsed: None,
                    });
                }
                TaskEvent::Completed { id, bytes } => {
                    pending.remove(&id);
                    sink.event(ProgressEvent {
                        message: format!("phase=Store; {item} completed ({bytes} bytes)"),
                        elapsed: Some(start.elapsed()),
                    });
                }
                TaskEvent::Failed { id, error } => {
                    pending.remove(&id);
                    sink.event(ProgressEvent {
                        message: format!("phase=Store; {item} failed: {error}"),
                        elapsed: None,
                    });
                }
                TaskEvent::Cancelled { id } => {
                    pending.remove(&id);
                }
                TaskEvent::Queued { .. }
                | TaskEvent::Started { .. }
                | TaskEvent::Paused { .. } => {}
            }
        }
        Ok(())
    }
}

fn item_row(item: &Item) -> ItemRow {
    ItemRow {
        id: item.id.to_string(),
        datetime: item.datetime.to_rfc3339(),
        phase: item.phase.map(|phase| phase.to_string()),
        sensor: item.sensor().map(str::to_string),
        cloud_cover: item.cloud_cover(),
        gsd: item.gsd(),
        off_nadir: item.off_nadir(),
        assets: item.assets.keys().cloned().collect(),
    }
}

fn level_info(grid: &crate::preview::TileGrid) -> LevelInfo {
    LevelInfo {
        width: grid.width,
        height: grid.height,
        tile_width: grid.tile_width,
        tile_height: grid.tile_height,
        tiles_across: grid.tiles_across,
        tiles_down: grid.tiles_down,
        compression: grid.compression,
    }
}

fn transfer_message(item: &ItemId, bytes: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => format!("phase=Transfer; {item} {}%", bytes * 100 / total),
        _ => format!("phase=Transfer; {item} {bytes} bytes"),
    }
}

/// Last path segment of the asset URL, when it looks like a filename.
fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?.trim();
    if segment.is_empty() || segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}
