use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const AUDIO_MP3_CHOICE: &str = "audio-mp3";
const AUDIO_SELECTOR: &str = "bestaudio[ext=opus]/bestaudio[ext=m4a]/ba/best";
const MP3_QUALITY_KBPS: &str = "192";

static HEIGHT_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioExtraction {
    pub codec: String,
    pub quality: String,
}

/// yt-dlp options derived from the user's quality choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPlan {
    pub selector: String,
    pub merge_output_format: Option<String>,
    pub extract_audio: Option<AudioExtraction>,
    pub height_limit: Option<u32>,
    /// Set when the plan could not honor the choice (no ffmpeg for mp3).
    pub warning: Option<String>,
}

impl FormatPlan {
    pub fn from_choice(choice: &str, audio_only: bool, ffmpeg_available: bool) -> Self {
        let choice = choice.trim();
        if audio_only || is_audio_choice(choice) {
            return Self::audio(ffmpeg_available);
        }
        Self::video(parse_height_limit(choice))
    }

    fn audio(ffmpeg_available: bool) -> Self {
        if ffmpeg_available {
            Self {
                selector: AUDIO_SELECTOR.to_string(),
                merge_output_format: None,
                extract_audio: Some(AudioExtraction {
                    codec: "mp3".to_string(),
                    quality: MP3_QUALITY_KBPS.to_string(),
                }),
                height_limit: None,
                warning: None,
            }
        } else {
            Self {
                selector: AUDIO_SELECTOR.to_string(),
                merge_output_format: None,
                extract_audio: None,
                height_limit: None,
                warning: Some(
                    "FFmpeg is needed for MP3 conversion but was not found; keeping the original audio format."
                        .to_string(),
                ),
            }
        }
    }

    fn video(height_limit: Option<u32>) -> Self {
        let parts: Vec<String> = match height_limit {
            Some(h) => {
                let f = format!("[height<={h}]");
                vec![
                    format!("bv{f}[ext=mp4]+ba[ext=m4a]/b{f}[ext=mp4]"),
                    format!("bv{f}[ext=webm]+ba[ext=opus]/b{f}[ext=webm]"),
                    format!("bv{f}+ba/b{f}"),
                    format!("b{f}[ext=mp4]"),
                    format!("b{f}[ext=webm]"),
                    format!("b{f}"),
                ]
            }
            None => vec![
                "bv[ext=mp4]+ba[ext=m4a]/b[ext=mp4]".to_string(),
                "bv[ext=webm]+ba[ext=opus]/b[ext=webm]".to_string(),
                "bv+ba/b".to_string(),
                "b[ext=mp4]".to_string(),
                "b[ext=webm]".to_string(),
                "b".to_string(),
            ],
        };

        Self {
            selector: parts.join("/"),
            merge_output_format: Some("mp4".to_string()),
            extract_audio: None,
            height_limit,
            warning: None,
        }
    }

    /// Arguments appended to a yt-dlp download invocation.
    pub fn yt_dlp_args(&self) -> Vec<String> {
        let mut args = vec!["-f".to_string(), self.selector.clone()];
        if let Some(ext) = &self.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(ext.clone());
        }
        if let Some(audio) = &self.extract_audio {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push(audio.codec.clone());
            args.push("--audio-quality".to_string());
            args.push(audio.quality.clone());
        }
        args
    }
}

fn is_audio_choice(choice: &str) -> bool {
    let lower = choice.to_ascii_lowercase();
    lower == AUDIO_MP3_CHOICE || lower == "mp3" || lower.contains("audio only")
}

pub fn parse_height_limit(choice: &str) -> Option<u32> {
    let re = HEIGHT_RE.get_or_init(|| Regex::new(r"\b(\d{3,4})p\b").expect("static regex"));
    re.captures(choice)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|h| *h > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_is_parsed_from_labels() {
        assert_eq!(parse_height_limit("720p"), Some(720));
        assert_eq!(parse_height_limit("Best video up to 1080p (mp4)"), Some(1080));
        assert_eq!(parse_height_limit("best"), None);
        assert_eq!(parse_height_limit("7200px"), None);
    }

    #[test]
    fn limited_video_filters_every_alternative() {
        let plan = FormatPlan::from_choice("720p", false, true);
        assert_eq!(plan.height_limit, Some(720));
        assert!(plan
            .selector
            .starts_with("bv[height<=720][ext=mp4]+ba[ext=m4a]/b[height<=720][ext=mp4]/"));
        assert!(plan.selector.ends_with("/b[height<=720]"));
        for alternative in plan.selector.split('/') {
            assert!(alternative.contains("[height<=720]"), "{alternative}");
        }
        assert_eq!(plan.merge_output_format.as_deref(), Some("mp4"));
    }

    #[test]
    fn unlimited_video_falls_back_to_best() {
        let plan = FormatPlan::from_choice("best", false, false);
        assert!(plan.selector.ends_with("/b[ext=mp4]/b[ext=webm]/b"));
        assert!(plan.extract_audio.is_none());
        assert!(plan.warning.is_none());
    }

    #[test]
    fn audio_only_converts_to_mp3_with_ffmpeg() {
        let plan = FormatPlan::from_choice("720p", true, true);
        assert_eq!(plan.selector, AUDIO_SELECTOR);
        let audio = plan.extract_audio.clone().expect("extract audio");
        assert_eq!(audio.codec, "mp3");
        let args = plan.yt_dlp_args();
        assert!(args.contains(&"--extract-audio".to_string()));
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn audio_without_ffmpeg_warns_and_skips_conversion() {
        let plan = FormatPlan::from_choice(AUDIO_MP3_CHOICE, false, false);
        assert!(plan.extract_audio.is_none());
        assert!(plan.warning.is_some());
    }
}
