use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_RANGES, CONTENT_TYPE, ETAG, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use url::Url;

use crate::catalog::{Asset, Item};
use crate::domain::AssetRole;
use crate::error::StormsightError;

/// GeoTIFF flavors we can stream tiles from. Everything else is
/// download-only.
pub fn is_streamable_media_type(media_type: &str) -> bool {
    let normalized = media_type.trim().to_lowercase();
    normalized.starts_with("image/tiff") || normalized == "image/vnd.stac.geotiff"
}

fn is_preview_media_type(media_type: &str) -> bool {
    let normalized = media_type.trim().to_lowercase();
    normalized.starts_with("image/png") || normalized.starts_with("image/jpeg")
}

/// Picks the asset for a role.
///
/// `visual` falls back to the first GeoTIFF asset when the catalog does not
/// use the conventional key; `thumbnail` falls back to the STAC roles array
/// and then to any PNG/JPEG. Named roles match the asset key first, then
/// the roles array. Asset keys are iterated in map order, so the fallback
/// is deterministic.
pub fn resolve<'a>(item: &'a Item, role: &AssetRole) -> Result<&'a Asset, StormsightError> {
    let not_found = || StormsightError::AssetNotFound {
        item: item.id.to_string(),
        role: role.to_string(),
    };
    if let Some(asset) = item.assets.get(role.key()) {
        return Ok(asset);
    }
    let fallback = match role {
        AssetRole::Visual => item.assets.values().find(|asset| {
            asset
                .media_type
                .as_deref()
                .map(is_streamable_media_type)
                .unwrap_or(false)
        }),
        AssetRole::Thumbnail => item
            .assets
            .values()
            .find(|asset| asset.roles.iter().any(|r| r == "thumbnail"))
            .or_else(|| {
                item.assets.values().find(|asset| {
                    asset
                        .media_type
                        .as_deref()
                        .map(is_preview_media_type)
                        .unwrap_or(false)
                })
            }),
        AssetRole::Named(name) => item
            .assets
            .values()
            .find(|asset| asset.roles.iter().any(|r| r == name)),
    };
    fallback.ok_or_else(not_found)
}

/// What a HEAD probe learned about a remote object.
#[derive(Debug, Clone, Default)]
pub struct RemoteStat {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub accept_ranges: bool,
}

pub trait AssetProber: Send + Sync {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError>;
}

#[derive(Clone)]
pub struct HttpAssetProber {
    client: Client,
}

impl HttpAssetProber {
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
}

impl AssetProber for HttpAssetProber {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError> {
        let response =
            self.client
                .head(url.clone())
                .send()
                .map_err(|err| StormsightError::UnreachableAsset {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        if !response.status().is_success() {
            return Err(StormsightError::UnreachableAsset {
                url: url.to_string(),
                reason: format!("status {}", response.status().as_u16()),
            });
        }
        let headers = response.headers();
        let header_str = |name: reqwest::header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Ok(RemoteStat {
            content_length: response.content_length(),
            content_type: header_str(CONTENT_TYPE),
            etag: header_str(ETAG),
            accept_ranges: header_str(ACCEPT_RANGES)
                .map(|value| value.to_lowercase().contains("bytes"))
                .unwrap_or(false),
        })
    }
}

/// Result of validating an asset for streaming use.
#[derive(Debug, Clone, Serialize)]
pub struct AssetMetadata {
    pub media_type: String,
    pub byte_size: Option<u64>,
    pub etag: Option<String>,
    pub supports_range: bool,
}

pub struct AssetResolver<P: AssetProber> {
    prober: P,
}

impl<P: AssetProber> AssetResolver<P> {
    pub fn new(prober: P) -> Self {
        Self { prober }
    }

    /// Existence/metadata probe plus the streaming-eligibility gate. A
    /// header-only request, never the asset body. Non-raster media types
    /// fail `UnsupportedFormat`; they stay downloadable, just not
    /// streamable.
    pub fn validate(&self, asset: &Asset) -> Result<AssetMetadata, StormsightError> {
        let stat = self.prober.probe(&asset.href)?;
        let media_type = asset
            .media_type
            .clone()
            .or_else(|| stat.content_type.clone())
            .unwrap_or_default();
        if !is_streamable_media_type(&media_type) {
            return Err(StormsightError::UnsupportedFormat {
                url: asset.href.to_string(),
                media_type: if media_type.is_empty() {
                    "unknown".to_string()
                } else {
                    media_type
                },
            });
        }
        Ok(AssetMetadata {
            media_type,
            byte_size: stat.content_length.or(asset.size),
            etag: stat.etag,
            supports_range: stat.accept_ranges,
        })
    }
}
