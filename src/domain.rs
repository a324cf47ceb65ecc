use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StormsightError;

/// Acquisition phase of a disaster-response scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    /// Lenient reading of a catalog property value. Catalogs tag items as
    /// `pre`/`post` or `pre-event`/`post-event` interchangeably; anything
    /// else leaves the item untagged.
    pub fn from_property(value: &str) -> Option<Phase> {
        let normalized = value.trim().to_lowercase();
        let normalized = normalized.strip_suffix("-event").unwrap_or(&normalized);
        match normalized {
            "pre" => Some(Phase::Pre),
            "post" => Some(Phase::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => write!(f, "pre"),
            Phase::Post => write!(f, "post"),
        }
    }
}

impl FromStr for Phase {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::from_property(value).ok_or_else(|| StormsightError::InvalidPhase(value.to_string()))
    }
}

/// Phase predicate for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseFilter {
    #[default]
    Any,
    Pre,
    Post,
}

impl PhaseFilter {
    pub fn matches(&self, phase: Option<Phase>) -> bool {
        match self {
            PhaseFilter::Any => true,
            PhaseFilter::Pre => phase == Some(Phase::Pre),
            PhaseFilter::Post => phase == Some(Phase::Post),
        }
    }
}

impl fmt::Display for PhaseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseFilter::Any => write!(f, "any"),
            PhaseFilter::Pre => write!(f, "pre"),
            PhaseFilter::Post => write!(f, "post"),
        }
    }
}

impl FromStr for PhaseFilter {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "any" | "all" | "" => Ok(PhaseFilter::Any),
            other => match Phase::from_property(other) {
                Some(Phase::Pre) => Ok(PhaseFilter::Pre),
                Some(Phase::Post) => Ok(PhaseFilter::Post),
                None => Err(StormsightError::InvalidPhase(value.to_string())),
            },
        }
    }
}

impl From<Phase> for PhaseFilter {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pre => PhaseFilter::Pre,
            Phase::Post => PhaseFilter::Post,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if !is_valid_id(&normalized, 128) {
            return Err(StormsightError::InvalidEventId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if !is_valid_id(&normalized, 256) {
            return Err(StormsightError::InvalidItemId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

fn is_valid_id(value: &str, max_len: usize) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
}

/// Which asset of an item an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetRole {
    /// Display raster; falls back to any GeoTIFF asset during resolution.
    Visual,
    Thumbnail,
    Named(String),
}

impl AssetRole {
    pub fn key(&self) -> &str {
        match self {
            AssetRole::Visual => "visual",
            AssetRole::Thumbnail => "thumbnail",
            AssetRole::Named(name) => name,
        }
    }
}

impl fmt::Display for AssetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for AssetRole {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "visual" => Ok(AssetRole::Visual),
            "thumbnail" => Ok(AssetRole::Thumbnail),
            "" => Err(StormsightError::InvalidRole(value.to_string())),
            _ => {
                if normalized
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':'))
                {
                    Ok(AssetRole::Named(normalized))
                } else {
                    Err(StormsightError::InvalidRole(value.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::StormsightError;

    #[test]
    fn phase_property_normalization() {
        assert_eq!(Phase::from_property("pre"), Some(Phase::Pre));
        assert_eq!(Phase::from_property("Pre-Event"), Some(Phase::Pre));
        assert_eq!(Phase::from_property(" post-event "), Some(Phase::Post));
        assert_eq!(Phase::from_property("during"), None);
        assert_eq!(Phase::from_property(""), None);
    }

    #[test]
    fn phase_filter_parsing() {
        assert_eq!("any".parse::<PhaseFilter>().unwrap(), PhaseFilter::Any);
        assert_eq!("all".parse::<PhaseFilter>().unwrap(), PhaseFilter::Any);
        assert_eq!(
            "pre-event".parse::<PhaseFilter>().unwrap(),
            PhaseFilter::Pre
        );
        assert_matches!(
            "mid".parse::<PhaseFilter>(),
            Err(StormsightError::InvalidPhase(_))
        );
    }

    #[test]
    fn phase_filter_matching() {
        assert!(PhaseFilter::Any.matches(None));
        assert!(PhaseFilter::Any.matches(Some(Phase::Post)));
        assert!(PhaseFilter::Pre.matches(Some(Phase::Pre)));
        assert!(!PhaseFilter::Pre.matches(Some(Phase::Post)));
        assert!(!PhaseFilter::Post.matches(None));
    }

    #[test]
    fn event_id_validation() {
        let id: EventId = "hurricane-ian-2022".parse().unwrap();
        assert_eq!(id.as_str(), "hurricane-ian-2022");
        assert_matches!(
            "".parse::<EventId>(),
            Err(StormsightError::InvalidEventId(_))
        );
        assert_matches!(
            "bad event".parse::<EventId>(),
            Err(StormsightError::InvalidEventId(_))
        );
    }

    #[test]
    fn item_id_validation() {
        let id: ItemId = "10300100D1234500-visual".parse().unwrap();
        assert_eq!(id.as_str(), "10300100D1234500-visual");
        assert_matches!(
            "a/b".parse::<ItemId>(),
            Err(StormsightError::InvalidItemId(_))
        );
    }

    #[test]
    fn asset_role_parsing() {
        assert_eq!("visual".parse::<AssetRole>().unwrap(), AssetRole::Visual);
        assert_eq!(
            "Thumbnail".parse::<AssetRole>().unwrap(),
            AssetRole::Thumbnail
        );
        assert_eq!(
            "ms_analytic".parse::<AssetRole>().unwrap(),
            AssetRole::Named("ms_analytic".to_string())
        );
        assert_matches!(
            "".parse::<AssetRole>(),
            Err(StormsightError::InvalidRole(_))
        );
    }
}
