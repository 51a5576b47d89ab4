use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::CatalogConfig;
use crate::error::AppError;
use crate::result::Result;

/// Read-only show and artist lookups
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Artists assigned to the show, `None` for an unknown show
    async fn show_artists(&self, show_id: &str) -> Option<Vec<String>>;

    /// Track keys owned by the artist, `None` for an unknown artist
    async fn artist_tracks(&self, artist_id: &str) -> Option<Vec<String>>;

    /// An open catalog accepts every show and track
    fn is_open(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct StaticCatalog {
    shows: HashMap<String, Vec<String>>,
    artists: HashMap<String, Vec<String>>,
}

impl StaticCatalog {
    pub fn from_config(cfg: &CatalogConfig) -> Self {
        Self {
            shows: cfg
                .shows
                .iter()
                .map(|s| (s.id.clone(), s.artists.clone()))
                .collect(),
            artists: cfg
                .artists
                .iter()
                .map(|a| (a.id.clone(), a.tracks.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn show_artists(&self, show_id: &str) -> Option<Vec<String>> {
        self.shows.get(show_id).cloned()
    }

    async fn artist_tracks(&self, artist_id: &str) -> Option<Vec<String>> {
        self.artists.get(artist_id).cloned()
    }

    fn is_open(&self) -> bool {
        self.shows.is_empty()
    }
}

pub async fn ensure_show(catalog: &dyn Catalog, show_id: &str) -> Result<()> {
    if !storage::path::validate_segment(show_id) {
        return Err(AppError::bad_request(format!("invalid show id: {:?}", show_id)));
    }
    if catalog.is_open() || catalog.show_artists(show_id).await.is_some() {
        Ok(())
    } else {
        Err(AppError::not_found(format!("show {} not found", show_id)))
    }
}

/// The track must belong to an artist assigned to the show
pub async fn validate_marker(
    catalog: &dyn Catalog,
    show_id: &str,
    artist_id: &str,
    track_key: &str,
) -> Result<()> {
    if !storage::path::validate_path(track_key) {
        return Err(AppError::bad_request(format!("invalid track key: {:?}", track_key)));
    }
    if catalog.is_open() {
        return Ok(());
    }
    let artists = catalog
        .show_artists(show_id)
        .await
        .ok_or_else(|| AppError::not_found(format!("show {} not found", show_id)))?;
    if !artists.iter().any(|a| a == artist_id) {
        return Err(AppError::Forbidden(format!(
            "artist {} is not assigned to show {}",
            artist_id, show_id
        )));
    }
    let tracks = catalog
        .artist_tracks(artist_id)
        .await
        .ok_or_else(|| AppError::not_found(format!("artist {} not found", artist_id)))?;
    if !tracks.iter().any(|t| t == track_key) {
        return Err(AppError::Forbidden(format!(
            "track {} does not belong to artist {}",
            track_key, artist_id
        )));
    }
    Ok(())
}
