//! Catalog-driven access to disaster-response imagery: browse STAC events,
//! filter scenes by footprint and phase, stream COG tiles without full
//! downloads, and fetch assets with resumable, verified transfers.

pub mod app;
pub mod assets;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod output;
pub mod preview;
pub mod selection;
pub mod store;
