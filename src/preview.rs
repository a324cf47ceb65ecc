use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use lru::LruCache;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use url::Url;

use crate::assets::{AssetProber, HttpAssetProber, RemoteStat, is_streamable_media_type};
use crate::catalog::Asset;
use crate::error::{RangeReadReason, StormsightError};

/// Granularity of header reads while locating the tile index.
const HEADER_CHUNK: u64 = 64 * 1024;
/// A COG keeps its directories at the front; refusing to chase an index
/// deeper than this keeps a hostile or broken file from draining us.
const HEADER_CAP: u64 = 16 * 1024 * 1024;
const MAX_IFDS: usize = 32;
const MAX_TILES_PER_LEVEL: u64 = 1 << 22;

const TAG_SUBFILE_TYPE: u16 = 254;
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_COMPRESSION: u16 = 259;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;

pub trait RangeClient: Send + Sync {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError>;
    fn read_range(&self, url: &Url, start: u64, length: u64)
    -> Result<Vec<u8>, StormsightError>;
}

#[derive(Clone)]
pub struct HttpRangeClient {
    client: Client,
    prober: HttpAssetProber,
}

impl HttpRangeClient {
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
        Ok(Self {
            client,
            prober: HttpAssetProber::new(timeout_secs)?,
        })
    }
}

impl RangeClient for HttpRangeClient {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError> {
        self.prober.probe(url)
    }

    fn read_range(
        &self,
        url: &Url,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, StormsightError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let range_err = |reason: RangeReadReason| StormsightError::RangeRead {
            url: url.to_string(),
            reason,
        };
        // length >= 1 here; saturate so a bogus remote offset cannot wrap.
        let end = start.saturating_add(length - 1);
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(|err| range_err(RangeReadReason::Connection(err.to_string())))?;
        match response.status().as_u16() {
            206 => response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|err| range_err(RangeReadReason::Connection(err.to_string()))),
            200 => Err(range_err(RangeReadReason::RangesUnsupported)),
            status => Err(range_err(RangeReadReason::Http(status))),
        }
    }
}

/// Tile address: reduced-resolution level (0 = full resolution), then
/// column/row within that level's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub level: usize,
    pub col: u32,
    pub row: u32,
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{},{}", self.level, self.col, self.row)
    }
}

/// Tile layout of one image directory.
#[derive(Debug, Clone)]
pub struct TileGrid {
    pub width: u64,
    pub height: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_across: u32,
    pub tiles_down: u32,
    pub compression: u16,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TileKey {
    source: String,
    level: usize,
    index: usize,
}

/// Byte-bounded LRU over raw tile payloads, shared across handles.
struct TileCache {
    entries: LruCache<TileKey, Arc<Vec<u8>>>,
    total_bytes: usize,
    capacity: usize,
}

impl TileCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            capacity,
        }
    }

    fn get(&mut self, key: &TileKey) -> Option<Arc<Vec<u8>>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: TileKey, bytes: Arc<Vec<u8>>) {
        if bytes.len() > self.capacity {
            return;
        }
        if let Some(previous) = self.entries.put(key, Arc::clone(&bytes)) {
            self.total_bytes -= previous.len();
        }
        self.total_bytes += bytes.len();
        while self.total_bytes > self.capacity {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }
}

/// Caps concurrent tile fetches so previews do not saturate the link.
struct FetchGate {
    limit: usize,
    active: Mutex<usize>,
    released: Condvar,
}

struct GatePermit<'a> {
    gate: &'a FetchGate,
}

impl FetchGate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            active: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) -> GatePermit<'_> {
        let mut active = self.active.lock().unwrap();
        while *active >= self.limit {
            active = self.released.wait(active).unwrap();
        }
        *active += 1;
        GatePermit { gate: self }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *self.gate.active.lock().unwrap() -= 1;
        self.gate.released.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct PreviewOptions {
    pub cache_bytes: usize,
    pub max_parallel_reads: usize,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            cache_bytes: 64 * 1024 * 1024,
            max_parallel_reads: 8,
        }
    }
}

/// Builds read-only tiled handles over remote rasters. Never writes to
/// disk; every read is a pure range fetch keyed by tile coordinate.
pub struct PreviewAdapter<R: RangeClient> {
    client: Arc<R>,
    cache: Arc<Mutex<TileCache>>,
    gate: Arc<FetchGate>,
}

impl<R: RangeClient> PreviewAdapter<R> {
    pub fn new(client: R, options: PreviewOptions) -> Self {
        Self {
            client: Arc::new(client),
            cache: Arc::new(Mutex::new(TileCache::new(options.cache_bytes))),
            gate: Arc::new(FetchGate::new(options.max_parallel_reads)),
        }
    }

    pub fn open(&self, asset: &Asset) -> Result<TiledHandle<R>, StormsightError> {
        if let Some(media_type) = &asset.media_type {
            if !is_streamable_media_type(media_type) {
                return Err(StormsightError::UnsupportedFormat {
                    url: asset.href.to_string(),
                    media_type: media_type.clone(),
                });
            }
        }
        let stat = self.client.probe(&asset.href)?;
        if asset.media_type.is_none() {
            if let Some(content_type) = &stat.content_type {
                if !is_streamable_media_type(content_type) {
                    return Err(StormsightError::UnsupportedFormat {
                        url: asset.href.to_string(),
                        media_type: content_type.clone(),
                    });
                }
            }
        }
        let levels = parse_tile_grids(self.client.as_ref(), &asset.href)?;
        let expires_at = parse_expiry(&asset.href);
        let mut source = asset.href.clone();
        source.set_query(None);
        let source = match &stat.etag {
            Some(etag) => format!("{source}|{etag}"),
            None => source.to_string(),
        };
        Ok(TiledHandle {
            url: asset.href.clone(),
            source,
            levels,
            expires_at,
            signed: expires_at.is_some() || is_signed(&asset.href),
            total_bytes: stat.content_length,
            client: Arc::clone(&self.client),
            cache: Arc::clone(&self.cache),
            gate: Arc::clone(&self.gate),
        })
    }
}

/// Read-only capability over one remote raster. Safe to share across
/// threads; concurrent `read_tile` calls do not disturb each other.
/// Dropping the handle has no side effects on disk.
pub struct TiledHandle<R: RangeClient> {
    url: Url,
    source: String,
    levels: Vec<TileGrid>,
    expires_at: Option<DateTime<Utc>>,
    signed: bool,
    total_bytes: Option<u64>,
    client: Arc<R>,
    cache: Arc<Mutex<TileCache>>,
    gate: Arc<FetchGate>,
}

impl<R: RangeClient> fmt::Debug for TiledHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiledHandle")
            .field("url", &self.url)
            .field("levels", &self.levels)
            .field("expires_at", &self.expires_at)
            .field("signed", &self.signed)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

impl<R: RangeClient> TiledHandle<R> {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn levels(&self) -> &[TileGrid] {
        &self.levels
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// Raw (still compressed) bytes of one tile. Decoding belongs to the
    /// host rendering engine.
    pub fn read_tile(&self, coord: TileCoord) -> Result<Arc<Vec<u8>>, StormsightError> {
        let range_err = |reason: RangeReadReason| StormsightError::RangeRead {
            url: self.url.to_string(),
            reason,
        };
        if let Some(expires_at) = self.expires_at {
            if Utc::now() >= expires_at {
                return Err(range_err(RangeReadReason::Expired));
            }
        }
        let grid = self
            .levels
            .get(coord.level)
            .filter(|grid| coord.col < grid.tiles_across && coord.row < grid.tiles_down)
            .ok_or_else(|| range_err(RangeReadReason::TileOutOfRange(coord.to_string())))?;
        let index = coord.row as usize * grid.tiles_across as usize + coord.col as usize;
        let offset = grid.offsets[index];
        let count = grid.byte_counts[index];
        if count == 0 {
            // sparse region: nothing was ever written for this tile
            return Ok(Arc::new(Vec::new()));
        }
        let key = TileKey {
            source: self.source.clone(),
            level: coord.level,
            index,
        };
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(bytes);
        }
        let _permit = self.gate.acquire();
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(bytes);
        }
        let bytes = match self.client.read_range(&self.url, offset, count) {
            Ok(bytes) => bytes,
            Err(StormsightError::RangeRead {
                reason: RangeReadReason::Http(status),
                ..
            }) if self.signed && matches!(status, 401 | 403) => {
                return Err(range_err(RangeReadReason::Expired));
            }
            Err(err) => return Err(err),
        };
        if bytes.len() as u64 != count {
            return Err(range_err(RangeReadReason::Truncated {
                got: bytes.len() as u64,
                wanted: count,
            }));
        }
        let bytes = Arc::new(bytes);
        self.cache.lock().unwrap().put(key, Arc::clone(&bytes));
        Ok(bytes)
    }
}

/// Expiry instant of a signed URL, when the query carries one.
fn parse_expiry(url: &Url) -> Option<DateTime<Utc>> {
    let mut amz_date = None;
    let mut amz_expires = None;
    let mut legacy = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "X-Amz-Date" => {
                amz_date = NaiveDateTime::parse_from_str(&value, "%Y%m%dT%H%M%SZ").ok();
            }
            "X-Amz-Expires" => amz_expires = value.parse::<i64>().ok(),
            "Expires" => legacy = value.parse::<i64>().ok(),
            _ => {}
        }
    }
    if let (Some(date), Some(expires)) = (amz_date, amz_expires) {
        return Some(date.and_utc() + chrono::Duration::seconds(expires));
    }
    legacy.and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
}

fn is_signed(url: &Url) -> bool {
    url.query_pairs().any(|(key, _)| {
        matches!(key.as_ref(), "X-Amz-Signature" | "X-Amz-Credential" | "Signature")
    })
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

/// Incrementally fetched prefix of the remote file; the TIFF directory
/// walker reads through this so header bytes are fetched once.
struct HeaderReader<'a, R: RangeClient> {
    client: &'a R,
    url: &'a Url,
    endian: Endian,
    buf: Vec<u8>,
    eof: bool,
}

impl<'a, R: RangeClient> HeaderReader<'a, R> {
    fn new(client: &'a R, url: &'a Url) -> Self {
        Self {
            client,
            url,
            endian: Endian::Little,
            buf: Vec::new(),
            eof: false,
        }
    }

    fn parse_err(&self, message: impl Into<String>) -> StormsightError {
        StormsightError::Parse {
            node: self.url.to_string(),
            message: message.into(),
        }
    }

    fn ensure(&mut self, end: u64) -> Result<(), StormsightError> {
        if end as usize <= self.buf.len() {
            return Ok(());
        }
        if end > HEADER_CAP {
            return Err(self.parse_err(format!("tile index beyond the first {HEADER_CAP} bytes")));
        }
        if self.eof {
            return Err(self.parse_err("truncated TIFF header"));
        }
        let start = self.buf.len() as u64;
        let want = (end - start).max(HEADER_CHUNK);
        let bytes = self.client.read_range(self.url, start, want)?;
        if (bytes.len() as u64) < want {
            self.eof = true;
        }
        self.buf.extend_from_slice(&bytes);
        if end as usize > self.buf.len() {
            return Err(self.parse_err("truncated TIFF header"));
        }
        Ok(())
    }

    fn slice(&mut self, offset: u64, len: u64) -> Result<&[u8], StormsightError> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.parse_err(format!("implausible byte offset {offset}")))?;
        self.ensure(end)?;
        Ok(&self.buf[offset as usize..end as usize])
    }

    fn read_u16(&mut self, offset: u64) -> Result<u16, StormsightError> {
        let endian = self.endian;
        let raw = self.slice(offset, 2)?;
        let raw = [raw[0], raw[1]];
        Ok(match endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    fn read_u32(&mut self, offset: u64) -> Result<u32, StormsightError> {
        let endian = self.endian;
        let raw = self.slice(offset, 4)?;
        let raw = [raw[0], raw[1], raw[2], raw[3]];
        Ok(match endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    fn read_u64(&mut self, offset: u64) -> Result<u64, StormsightError> {
        let endian = self.endian;
        let raw = self.slice(offset, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(match endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }
}

fn unsupported(url: &Url, what: impl Into<String>) -> StormsightError {
    StormsightError::UnsupportedFormat {
        url: url.to_string(),
        media_type: what.into(),
    }
}

fn parse_tile_grids<R: RangeClient>(
    client: &R,
    url: &Url,
) -> Result<Vec<TileGrid>, StormsightError> {
    let mut reader = HeaderReader::new(client, url);
    let order = reader.slice(0, 2)?;
    let order = (order[0], order[1]);
    reader.endian = match order {
        (0x49, 0x49) => Endian::Little,
        (0x4D, 0x4D) => Endian::Big,
        _ => return Err(unsupported(url, "not a TIFF")),
    };
    let magic = reader.read_u16(2)?;
    let (bigtiff, mut ifd_offset) = match magic {
        42 => (false, reader.read_u32(4)? as u64),
        43 => {
            if reader.read_u16(4)? != 8 || reader.read_u16(6)? != 0 {
                return Err(unsupported(url, "malformed BigTIFF header"));
            }
            (true, reader.read_u64(8)?)
        }
        other => return Err(unsupported(url, format!("unrecognized TIFF magic {other}"))),
    };
    let mut grids = Vec::new();
    let mut visited = 0usize;
    while ifd_offset != 0 {
        visited += 1;
        if visited > MAX_IFDS {
            return Err(reader.parse_err("image directory chain too long"));
        }
        let (grid, next) = parse_ifd(&mut reader, ifd_offset, bigtiff)?;
        if let Some(grid) = grid {
            grids.push(grid);
        }
        ifd_offset = next;
    }
    if grids.is_empty() {
        return Err(unsupported(url, "no tiled image directories"));
    }
    Ok(grids)
}

fn parse_ifd<R: RangeClient>(
    reader: &mut HeaderReader<'_, R>,
    offset: u64,
    bigtiff: bool,
) -> Result<(Option<TileGrid>, u64), StormsightError> {
    let entry_size: u64 = if bigtiff { 20 } else { 12 };
    let count = if bigtiff {
        reader.read_u64(offset)?
    } else {
        reader.read_u16(offset)? as u64
    };
    if count > 4096 {
        return Err(reader.parse_err(format!("implausible directory entry count {count}")));
    }
    let entries_start = offset + if bigtiff { 8 } else { 2 };

    let mut width = None;
    let mut height = None;
    let mut tile_width = None;
    let mut tile_height = None;
    let mut compression = 1u64;
    let mut planar = 1u64;
    let mut subfile = 0u64;
    let mut offsets = None;
    let mut byte_counts = None;

    for i in 0..count {
        let entry = entries_start + i * entry_size;
        let tag = reader.read_u16(entry)?;
        let field_type = reader.read_u16(entry + 2)?;
        let value_count = if bigtiff {
            reader.read_u64(entry + 4)?
        } else {
            reader.read_u32(entry + 4)? as u64
        };
        let value_field = entry + if bigtiff { 12 } else { 8 };
        match tag {
            TAG_IMAGE_WIDTH => width = Some(read_scalar(reader, field_type, value_field, bigtiff)?),
            TAG_IMAGE_LENGTH => {
                height = Some(read_scalar(reader, field_type, value_field, bigtiff)?);
            }
            TAG_TILE_WIDTH => {
                tile_width = Some(read_scalar(reader, field_type, value_field, bigtiff)?);
            }
            TAG_TILE_LENGTH => {
                tile_height = Some(read_scalar(reader, field_type, value_field, bigtiff)?);
            }
            TAG_COMPRESSION => compression = read_scalar(reader, field_type, value_field, bigtiff)?,
            TAG_PLANAR_CONFIG => planar = read_scalar(reader, field_type, value_field, bigtiff)?,
            TAG_SUBFILE_TYPE => subfile = read_scalar(reader, field_type, value_field, bigtiff)?,
            TAG_TILE_OFFSETS => {
                offsets = Some(read_values(
                    reader,
                    field_type,
                    value_count,
                    value_field,
                    bigtiff,
                )?);
            }
            TAG_TILE_BYTE_COUNTS => {
                byte_counts = Some(read_values(
                    reader,
                    field_type,
                    value_count,
                    value_field,
                    bigtiff,
                )?);
            }
            _ => {}
        }
    }
    let next = if bigtiff {
        reader.read_u64(entries_start + count * entry_size)?
    } else {
        reader.read_u32(entries_start + count * entry_size)? as u64
    };

    // Masks and strip-organized directories are not previewable levels.
    if subfile & 0x4 != 0 {
        return Ok((None, next));
    }
    let (Some(width), Some(height), Some(tile_width), Some(tile_height)) =
        (width, height, tile_width, tile_height)
    else {
        return Ok((None, next));
    };
    let (Some(offsets), Some(byte_counts)) = (offsets, byte_counts) else {
        return Ok((None, next));
    };
    if planar == 2 {
        return Err(reader.parse_err("planar tile layout is not supported"));
    }
    if tile_width == 0 || tile_height == 0 {
        return Err(reader.parse_err("zero tile dimensions"));
    }
    if tile_width > u64::from(u32::MAX) || tile_height > u64::from(u32::MAX) {
        return Err(reader.parse_err(format!(
            "implausible tile dimensions {tile_width}x{tile_height}"
        )));
    }
    let tiles_across = width.div_ceil(tile_width);
    let tiles_down = height.div_ceil(tile_height);
    // Bounding each axis keeps the product below 2^44, so it cannot wrap.
    if tiles_across > MAX_TILES_PER_LEVEL || tiles_down > MAX_TILES_PER_LEVEL {
        return Err(reader.parse_err(format!(
            "implausible tile count {tiles_across}x{tiles_down}"
        )));
    }
    let expected = tiles_across * tiles_down;
    if expected > MAX_TILES_PER_LEVEL {
        return Err(reader.parse_err(format!("implausible tile count {expected}")));
    }
    if offsets.len() as u64 != expected || byte_counts.len() as u64 != expected {
        return Err(reader.parse_err(format!(
            "tile index arrays disagree with a {tiles_across}x{tiles_down} grid"
        )));
    }
    Ok((
        Some(TileGrid {
            width,
            height,
            tile_width: tile_width as u32,
            tile_height: tile_height as u32,
            tiles_across: tiles_across as u32,
            tiles_down: tiles_down as u32,
            compression: compression as u16,
            offsets,
            byte_counts,
        }),
        next,
    ))
}

fn read_scalar<R: RangeClient>(
    reader: &mut HeaderReader<'_, R>,
    field_type: u16,
    value_field: u64,
    bigtiff: bool,
) -> Result<u64, StormsightError> {
    match field_type {
        3 => Ok(reader.read_u16(value_field)? as u64),
        4 => Ok(reader.read_u32(value_field)? as u64),
        16 if bigtiff => reader.read_u64(value_field),
        other => Err(reader.parse_err(format!("unsupported scalar field type {other}"))),
    }
}

fn read_values<R: RangeClient>(
    reader: &mut HeaderReader<'_, R>,
    field_type: u16,
    count: u64,
    value_field: u64,
    bigtiff: bool,
) -> Result<Vec<u64>, StormsightError> {
    let size: u64 = match field_type {
        3 => 2,
        4 => 4,
        16 => 8,
        other => {
            return Err(reader.parse_err(format!("unsupported array field type {other}")));
        }
    };
    if count > MAX_TILES_PER_LEVEL {
        return Err(reader.parse_err(format!("implausible value count {count}")));
    }
    let inline: u64 = if bigtiff { 8 } else { 4 };
    let data_offset = if size * count <= inline {
        value_field
    } else if bigtiff {
        reader.read_u64(value_field)?
    } else {
        reader.read_u32(value_field)? as u64
    };
    let mut values = Vec::with_capacity(count as usize);
    for i in 0..count {
        // i * size stays under 2^25 thanks to the count cap above.
        let at = data_offset
            .checked_add(i * size)
            .ok_or_else(|| reader.parse_err(format!("implausible value offset {data_offset}")))?;
        values.push(match field_type {
            3 => reader.read_u16(at)? as u64,
            4 => reader.read_u32(at)? as u64,
            _ => reader.read_u64(at)?,
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_url_expiry() {
        let url = Url::parse(
            "https://bucket.s3.amazonaws.com/scene.tif?X-Amz-Date=20260301T120000Z&X-Amz-Expires=3600&X-Amz-Signature=abc",
        )
        .unwrap();
        let expires = parse_expiry(&url).unwrap();
        assert_eq!(expires.to_rfc3339(), "2026-03-01T13:00:00+00:00");
        assert!(is_signed(&url));

        let legacy = Url::parse("https://host/scene.tif?Expires=1700000000&Signature=s").unwrap();
        assert_eq!(
            parse_expiry(&legacy).unwrap(),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        );

        let plain = Url::parse("https://host/scene.tif").unwrap();
        assert_eq!(parse_expiry(&plain), None);
        assert!(!is_signed(&plain));
    }

    #[test]
    fn tile_cache_evicts_by_bytes() {
        let mut cache = TileCache::new(100);
        let key = |index: usize| TileKey {
            source: "s".to_string(),
            level: 0,
            index,
        };
        cache.put(key(0), Arc::new(vec![0u8; 40]));
        cache.put(key(1), Arc::new(vec![0u8; 40]));
        assert!(cache.get(&key(0)).is_some());
        // key(0) is now most recent; inserting a third evicts key(1)
        cache.put(key(2), Arc::new(vec![0u8; 40]));
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(2)).is_some());
        // oversized payloads are never cached
        cache.put(key(3), Arc::new(vec![0u8; 200]));
        assert!(cache.get(&key(3)).is_none());
        assert!(cache.total_bytes <= 100);
    }
}
