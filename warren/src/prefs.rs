//! Runtime preferences for cache sizing and leaf selection.

use serde::{Deserialize, Serialize};

/// Tunable preferences shared by the followee and explicit cache paths.
///
/// Unlike the ceilings in [`crate::limits`], which are protocol sanity
/// checks, these express how much local disk the user is willing to give
/// up and how big an attachment is still worth mirroring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    /// Byte budget for the aggregate followee cache.
    pub followee_cache_target_bytes: u64,
    /// Byte budget for the explicit lookup cache.
    pub explicit_cache_target_bytes: u64,
    /// Preferred maximum edge length of a mirrored video, in pixels.
    pub video_edge_pixel_max: u32,
    /// Largest thumbnail worth mirroring for a followee record.
    pub followee_thumbnail_max_bytes: u64,
    /// Largest audio leaf worth mirroring for a followee record.
    pub followee_audio_max_bytes: u64,
    /// Largest video leaf worth mirroring for a followee record.
    pub followee_video_max_bytes: u64,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            followee_cache_target_bytes: 10 * 1024 * 1024 * 1024,
            explicit_cache_target_bytes: 1024 * 1024 * 1024,
            video_edge_pixel_max: 1280,
            followee_thumbnail_max_bytes: 10 * 1024 * 1024,
            followee_audio_max_bytes: 200 * 1024 * 1024,
            followee_video_max_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}
