use crate::format::FormatPlan;
use crate::task::CancelToken;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a single video or a playlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_secs: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub is_playlist: bool,
    /// Playlist entries in order; a single video is its own only item.
    pub items: Vec<MediaItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// 1-based position in the playlist.
    pub index: u32,
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub duration_secs: Option<f64>,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectLink {
    pub title: Option<String>,
    pub playlist_index: Option<u32>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Starting,
    Downloading,
    Merging,
    ExtractingAudio,
    Converting,
    MovingFiles,
    PostProcessing,
}

impl ProgressStage {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressStage::Starting => "starting",
            ProgressStage::Downloading => "downloading",
            ProgressStage::Merging => "merging",
            ProgressStage::ExtractingAudio => "extracting audio",
            ProgressStage::Converting => "converting",
            ProgressStage::MovingFiles => "moving files",
            ProgressStage::PostProcessing => "post-processing",
        }
    }

    /// Maps a yt-dlp postprocessor key (`Merger`, `FFmpegExtractAudio`, ...).
    pub fn from_postprocessor(name: &str) -> Self {
        let name = name.trim();
        let key = name.strip_prefix("FFmpeg").unwrap_or(name);
        match key {
            "Merger" => ProgressStage::Merging,
            "ExtractAudio" => ProgressStage::ExtractingAudio,
            "VideoConvertor" | "VideoRemuxer" => ProgressStage::Converting,
            "MoveFiles" => ProgressStage::MovingFiles,
            _ => ProgressStage::PostProcessing,
        }
    }
}

/// One progress report from a running download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: ProgressStage,
    /// Percent of the current item, when known.
    pub percent: Option<f32>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub item_index: Option<u32>,
    pub item_count: Option<u32>,
    pub title: Option<String>,
}

impl ProgressUpdate {
    pub fn stage(stage: ProgressStage) -> Self {
        Self {
            stage,
            percent: None,
            speed: None,
            eta: None,
            item_index: None,
            item_count: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub plan: FormatPlan,
    /// Private workspace; every artifact must be written under it.
    pub work_dir: PathBuf,
    /// 1-based playlist positions; empty means the whole URL.
    pub playlist_items: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinksRequest {
    pub url: String,
    pub selector: String,
    pub playlist_items: Vec<u32>,
}

/// The media-extraction backend the runner drives.
///
/// Implementations must watch `cancel` and return [`crate::EngineError::Cancelled`]
/// promptly once it is set. The progress callback is invoked on the calling
/// thread.
pub trait Engine: Send + Sync {
    fn fetch_info(&self, url: &str, cancel: &CancelToken) -> Result<MediaInfo>;

    /// Downloads into `request.work_dir` and returns the final artifact paths.
    fn download(
        &self,
        request: &DownloadRequest,
        progress: &mut dyn FnMut(ProgressUpdate),
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>>;

    fn fetch_direct_links(
        &self,
        request: &LinksRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<DirectLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postprocessor_keys_map_to_stage_labels() {
        assert_eq!(ProgressStage::from_postprocessor("Merger"), ProgressStage::Merging);
        assert_eq!(
            ProgressStage::from_postprocessor("FFmpegExtractAudio"),
            ProgressStage::ExtractingAudio
        );
        assert_eq!(
            ProgressStage::from_postprocessor("VideoConvertor").label(),
            "converting"
        );
        assert_eq!(
            ProgressStage::from_postprocessor("MoveFiles"),
            ProgressStage::MovingFiles
        );
        assert_eq!(
            ProgressStage::from_postprocessor("EmbedThumbnail").label(),
            "post-processing"
        );
    }
}
