// ABOUTME: Request and response schema exchanged with tag reader workers
// ABOUTME: Payloads are JSON; the correlation id lives in the frame header, not here

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Value reported in `art_automatic` when the cover is stored inside the file
pub const EMBEDDED_COVER: &str = "(embedded)";

/// Container format of a media file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Not a recognised media file
    #[default]
    Unknown,
    /// Windows Media (`.wma`, `.asf`)
    Asf,
    /// Native FLAC
    Flac,
    /// MPEG-4 audio (`.m4a`, `.mp4`, `.aac`)
    Mp4,
    /// Musepack
    Mpc,
    /// MPEG layer 2/3
    Mpeg,
    /// FLAC in an Ogg container
    OggFlac,
    /// Speex in an Ogg container
    OggSpeex,
    /// Vorbis or Opus in an Ogg container
    OggVorbis,
    /// AIFF
    Aiff,
    /// RIFF WAVE
    Wav,
    /// True Audio
    TrueAudio,
    /// Network stream, never tagged
    Stream,
}

impl FileType {
    /// Guess the format from a file extension (case-insensitive)
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Self::Unknown;
        };

        match ext.to_ascii_lowercase().as_str() {
            "wma" | "asf" => Self::Asf,
            "flac" => Self::Flac,
            "m4a" | "mp4" | "aac" => Self::Mp4,
            "mpc" => Self::Mpc,
            "mp3" | "mp2" | "mpga" => Self::Mpeg,
            "oga" => Self::OggFlac,
            "spx" => Self::OggSpeex,
            "ogg" | "opus" => Self::OggVorbis,
            "aif" | "aiff" | "aifc" => Self::Aiff,
            "wav" => Self::Wav,
            "tta" => Self::TrueAudio,
            _ => Self::Unknown,
        }
    }

    /// Whether files of this type carry tags
    #[must_use]
    pub const fn is_media(self) -> bool {
        !matches!(self, Self::Unknown | Self::Stream)
    }
}

/// Tags and file properties of one song
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SongMetadata {
    /// Tags were read successfully
    pub valid: bool,

    /// Track title
    pub title: String,
    /// Track artist
    pub artist: String,
    /// Album title
    pub album: String,
    /// Album artist, when it differs from the track artist
    pub albumartist: String,
    /// Composer
    pub composer: String,
    /// Genre
    pub genre: String,
    /// Free-form comment
    pub comment: String,
    /// Release year, 0 when unknown
    pub year: i32,
    /// Track number, 0 when unknown
    pub track: i32,
    /// Disc number, 0 when unknown
    pub disc: i32,
    /// Beats per minute, 0.0 when unknown
    pub bpm: f32,
    /// Part of a various-artists compilation
    pub compilation: bool,

    /// Duration in nanoseconds
    pub length_nanosec: i64,
    /// Bitrate in kbit/s
    pub bitrate: i32,
    /// Sample rate in Hz
    pub samplerate: i32,

    /// File name without its directory
    pub basefilename: String,
    /// Size in bytes
    pub filesize: u64,
    /// Last modification time
    pub mtime: Option<DateTime<Utc>>,
    /// Last status change time
    pub ctime: Option<DateTime<Utc>>,
    /// Container format
    pub file_type: FileType,

    /// Times played to the end
    pub playcount: u32,
    /// Times skipped
    pub skipcount: u32,
    /// When the song was last played
    pub lastplayed: Option<DateTime<Utc>>,
    /// Listening score, 0 to 100
    pub score: u32,
    /// 0.0 to 1.0; `None` when never rated
    pub rating: Option<f32>,

    /// Cover reference found while reading tags
    pub art_automatic: Option<String>,
}

/// A library song as far as statistics and rating updates are concerned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Song {
    /// Media file on disk
    pub filename: PathBuf,
    /// Times played to the end
    pub playcount: u32,
    /// Times skipped
    pub skipcount: u32,
    /// When the song was last played
    pub lastplayed: Option<DateTime<Utc>>,
    /// Listening score, 0 to 100
    pub score: u32,
    /// 0.0 to 1.0; `None` clears the rating
    pub rating: Option<f32>,
}

impl Song {
    /// Song with no statistics yet
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }
}

/// Request sent to a tag reader worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagRequest {
    /// Read tags and file properties
    ReadFile {
        /// Target file
        filename: PathBuf,
    },
    /// Replace the file's tags with `metadata`
    SaveFile {
        /// Target file
        filename: PathBuf,
        /// Tags to write
        metadata: SongMetadata,
    },
    /// Check whether the file is a taggable media file
    IsMediaFile {
        /// Target file
        filename: PathBuf,
    },
    /// Fetch the cover image stored inside the file
    LoadEmbeddedArt {
        /// Target file
        filename: PathBuf,
    },
    /// Write play statistics into the file's tags
    UpdateSongStatistics {
        /// Target file
        filename: PathBuf,
        /// Times played
        playcount: u32,
        /// Times skipped
        skipcount: u32,
        /// Last play time
        lastplayed: Option<DateTime<Utc>>,
        /// Listening score
        score: u32,
    },
    /// Write the rating into the file's tags
    UpdateSongRating {
        /// Target file
        filename: PathBuf,
        /// New rating, `None` to clear
        rating: Option<f32>,
    },
}

impl TagRequest {
    /// File the request is about
    #[must_use]
    pub fn filename(&self) -> &Path {
        match self {
            Self::ReadFile { filename }
            | Self::SaveFile { filename, .. }
            | Self::IsMediaFile { filename }
            | Self::LoadEmbeddedArt { filename }
            | Self::UpdateSongStatistics { filename, .. }
            | Self::UpdateSongRating { filename, .. } => filename,
        }
    }

    /// Statistics update carrying `song`'s counters
    #[must_use]
    pub fn statistics_for(song: &Song) -> Self {
        Self::UpdateSongStatistics {
            filename: song.filename.clone(),
            playcount: song.playcount,
            skipcount: song.skipcount,
            lastplayed: song.lastplayed,
            score: song.score,
        }
    }

    /// Rating update carrying `song`'s rating
    #[must_use]
    pub fn rating_for(song: &Song) -> Self {
        Self::UpdateSongRating {
            filename: song.filename.clone(),
            rating: song.rating,
        }
    }
}

/// Response from a tag reader worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagResponse {
    /// Answer to [`TagRequest::ReadFile`]
    ReadFile {
        /// `None` when the file could not be read at all
        metadata: Option<SongMetadata>,
    },
    /// Answer to [`TagRequest::SaveFile`]
    SaveFile {
        /// Tags were written
        success: bool,
    },
    /// Answer to [`TagRequest::IsMediaFile`]
    IsMediaFile {
        /// The file is a taggable media file
        success: bool,
    },
    /// Answer to [`TagRequest::LoadEmbeddedArt`]
    LoadEmbeddedArt {
        /// Raw image bytes, empty when there is no cover
        data: Vec<u8>,
    },
    /// Answer to [`TagRequest::UpdateSongStatistics`]
    UpdateSongStatistics {
        /// Statistics were written
        success: bool,
    },
    /// Answer to [`TagRequest::UpdateSongRating`]
    UpdateSongRating {
        /// Rating was written
        success: bool,
    },
    /// The worker could not make sense of the request
    Error {
        /// What went wrong
        message: String,
    },
}

impl TagResponse {
    /// Variant name, for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::SaveFile { .. } => "save_file",
            Self::IsMediaFile { .. } => "is_media_file",
            Self::LoadEmbeddedArt { .. } => "load_embedded_art",
            Self::UpdateSongStatistics { .. } => "update_song_statistics",
            Self::UpdateSongRating { .. } => "update_song_rating",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_shape() {
        let request = TagRequest::IsMediaFile {
            filename: PathBuf::from("/music/a.flac"),
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "type": "is_media_file", "filename": "/music/a.flac" })
        );
    }

    #[test]
    fn test_metadata_missing_fields_default() {
        let metadata: SongMetadata = serde_json::from_str(r#"{ "title": "Song", "year": 1999 }"#).unwrap();

        assert_eq!(metadata.title, "Song");
        assert_eq!(metadata.year, 1999);
        assert!(!metadata.valid);
        assert_eq!(metadata.rating, None);
        assert_eq!(metadata.file_type, FileType::Unknown);
    }

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(FileType::from_path(Path::new("a.FLAC")), FileType::Flac);
        assert_eq!(FileType::from_path(Path::new("dir/b.mp3")), FileType::Mpeg);
        assert_eq!(FileType::from_path(Path::new("c.ogg")), FileType::OggVorbis);
        assert_eq!(FileType::from_path(Path::new("notes.txt")), FileType::Unknown);
        assert_eq!(FileType::from_path(Path::new("no_extension")), FileType::Unknown);
        assert!(FileType::Wav.is_media());
        assert!(!FileType::Unknown.is_media());
    }

    #[test]
    fn test_song_requests() {
        let song = Song {
            playcount: 4,
            rating: Some(0.8),
            ..Song::new("/music/x.mp3")
        };

        match TagRequest::statistics_for(&song) {
            TagRequest::UpdateSongStatistics { filename, playcount, .. } => {
                assert_eq!(filename, PathBuf::from("/music/x.mp3"));
                assert_eq!(playcount, 4);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let rating = TagRequest::rating_for(&song);
        assert_eq!(rating.filename(), Path::new("/music/x.mp3"));
        assert_eq!(
            rating,
            TagRequest::UpdateSongRating {
                filename: PathBuf::from("/music/x.mp3"),
                rating: Some(0.8),
            }
        );
    }
}
