// ABOUTME: Reference tag reader service run inside the mediaworkers-tagreader worker
// ABOUTME: Tags and statistics live in a JSON sidecar next to each media file

//! Filesystem-backed tag store.
//!
//! For `song.flac` the tags are kept in `song.flac.tags.json`. File
//! properties (size, timestamps, format) always come from the media file
//! itself; the sidecar supplies tags, statistics, rating and embedded art.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::protocol::{FileType, SongMetadata, TagRequest, TagResponse, EMBEDDED_COVER};
use crate::worker_pool::WorkerService;

/// Suffix appended to a media file name to find its tag sidecar
pub const SIDECAR_SUFFIX: &str = ".tags.json";

/// Everything stored in a sidecar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoredTags {
    title: String,
    artist: String,
    album: String,
    albumartist: String,
    composer: String,
    genre: String,
    comment: String,
    year: i32,
    track: i32,
    disc: i32,
    bpm: f32,
    compilation: bool,
    length_nanosec: i64,
    bitrate: i32,
    samplerate: i32,

    playcount: u32,
    skipcount: u32,
    lastplayed: Option<DateTime<Utc>>,
    score: u32,
    rating: Option<f32>,

    /// Embedded cover image bytes
    art: Vec<u8>,
}

impl StoredTags {
    fn apply_tags(&mut self, metadata: &SongMetadata) {
        self.title.clone_from(&metadata.title);
        self.artist.clone_from(&metadata.artist);
        self.album.clone_from(&metadata.album);
        self.albumartist.clone_from(&metadata.albumartist);
        self.composer.clone_from(&metadata.composer);
        self.genre.clone_from(&metadata.genre);
        self.comment.clone_from(&metadata.comment);
        self.year = metadata.year;
        self.track = metadata.track;
        self.disc = metadata.disc;
        self.bpm = metadata.bpm;
        self.compilation = metadata.compilation;
    }

    fn fill(&self, metadata: &mut SongMetadata) {
        metadata.title.clone_from(&self.title);
        metadata.artist.clone_from(&self.artist);
        metadata.album.clone_from(&self.album);
        metadata.albumartist.clone_from(&self.albumartist);
        metadata.composer.clone_from(&self.composer);
        metadata.genre.clone_from(&self.genre);
        metadata.comment.clone_from(&self.comment);
        metadata.year = self.year;
        metadata.track = self.track;
        metadata.disc = self.disc;
        metadata.bpm = self.bpm;
        metadata.compilation = self.compilation;
        metadata.length_nanosec = self.length_nanosec;
        metadata.bitrate = self.bitrate;
        metadata.samplerate = self.samplerate;
        metadata.playcount = self.playcount;
        metadata.skipcount = self.skipcount;
        metadata.lastplayed = self.lastplayed;
        metadata.score = self.score;
        metadata.rating = self.rating;
        if !self.art.is_empty() {
            metadata.art_automatic = Some(EMBEDDED_COVER.to_string());
        }
    }
}

/// Sidecar path for `file`
#[must_use]
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Tag reader backed by JSON sidecar files
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarTagService;

impl SidecarTagService {
    /// Service storing sidecars next to each media file
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Answer one decoded request
    pub fn handle_request(&self, request: TagRequest) -> TagResponse {
        match request {
            TagRequest::ReadFile { filename } => TagResponse::ReadFile {
                metadata: self.read_file(&filename),
            },
            TagRequest::SaveFile { filename, metadata } => TagResponse::SaveFile {
                success: self.save_file(&filename, &metadata),
            },
            TagRequest::IsMediaFile { filename } => TagResponse::IsMediaFile {
                success: self.is_media_file(&filename),
            },
            TagRequest::LoadEmbeddedArt { filename } => TagResponse::LoadEmbeddedArt {
                data: self.load_embedded_art(&filename),
            },
            TagRequest::UpdateSongStatistics {
                filename,
                playcount,
                skipcount,
                lastplayed,
                score,
            } => TagResponse::UpdateSongStatistics {
                success: self.update(&filename, |tags| {
                    tags.playcount = playcount;
                    tags.skipcount = skipcount;
                    tags.lastplayed = lastplayed;
                    tags.score = score;
                }),
            },
            TagRequest::UpdateSongRating { filename, rating } => TagResponse::UpdateSongRating {
                success: self.update(&filename, |tags| tags.rating = rating),
            },
        }
    }

    /// File properties plus sidecar tags; `None` if the file is missing
    pub fn read_file(&self, filename: &Path) -> Option<SongMetadata> {
        debug!(file = %filename.display(), "Reading tags");

        let info = match fs::metadata(filename) {
            Ok(info) if info.is_file() => info,
            Ok(_) => return None,
            Err(e) => {
                debug!(file = %filename.display(), error = %e, "Cannot stat file");
                return None;
            }
        };

        let file_type = FileType::from_path(filename);
        let mut metadata = SongMetadata {
            basefilename: filename
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            filesize: info.len(),
            mtime: info.modified().ok().map(DateTime::<Utc>::from),
            ctime: info.created().ok().map(DateTime::<Utc>::from),
            file_type,
            valid: file_type.is_media(),
            ..SongMetadata::default()
        };

        if metadata.valid {
            match load_sidecar(filename) {
                Ok(tags) => tags.fill(&mut metadata),
                Err(e) => {
                    warn!(file = %filename.display(), error = %e, "Unreadable tag sidecar");
                    metadata.valid = false;
                }
            }
        }

        Some(metadata)
    }

    /// Store the tag fields of `metadata`, keeping statistics and art
    pub fn save_file(&self, filename: &Path, metadata: &SongMetadata) -> bool {
        debug!(file = %filename.display(), "Saving tags");
        let saved = self.update(filename, |tags| tags.apply_tags(metadata));

        if saved {
            // File watchers only notice the change through the media file's timestamp
            if let Err(e) = touch(filename) {
                debug!(file = %filename.display(), error = %e, "Failed to touch file");
            }
        }
        saved
    }

    /// Existing file with a known media extension
    pub fn is_media_file(&self, filename: &Path) -> bool {
        debug!(file = %filename.display(), "Checking for valid file");
        filename.is_file() && FileType::from_path(filename).is_media()
    }

    /// Cover bytes from the sidecar; empty when there are none
    pub fn load_embedded_art(&self, filename: &Path) -> Vec<u8> {
        if filename.as_os_str().is_empty() || !self.is_media_file(filename) {
            return vec![];
        }
        debug!(file = %filename.display(), "Loading art");
        load_sidecar(filename).map(|tags| tags.art).unwrap_or_default()
    }

    /// Store raw cover bytes for `filename`
    pub fn save_embedded_art(&self, filename: &Path, art: &[u8]) -> bool {
        self.update(filename, |tags| tags.art = art.to_vec())
    }

    fn update<F>(&self, filename: &Path, change: F) -> bool
    where
        F: FnOnce(&mut StoredTags),
    {
        if !self.is_media_file(filename) {
            debug!(file = %filename.display(), "Not a media file, not updating tags");
            return false;
        }

        let result = load_sidecar(filename).and_then(|mut tags| {
            change(&mut tags);
            store_sidecar(filename, &tags)
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "Failed to update tags");
                false
            }
        }
    }
}

impl WorkerService for SidecarTagService {
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let response = match serde_json::from_slice::<TagRequest>(payload) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                warn!(error = %e, "Undecodable request");
                TagResponse::Error {
                    message: format!("invalid request: {e}"),
                }
            }
        };

        match serde_json::to_vec(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to encode response");
                serde_json::to_vec(&TagResponse::Error {
                    message: e.to_string(),
                })
                .ok()
            }
        }
    }
}

fn load_sidecar(filename: &Path) -> io::Result<StoredTags> {
    match fs::read(sidecar_path(filename)) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoredTags::default()),
        Err(e) => Err(e),
    }
}

fn store_sidecar(filename: &Path, tags: &StoredTags) -> io::Result<()> {
    let path = sidecar_path(filename);
    let bytes = serde_json::to_vec_pretty(tags).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // Write then rename so a crash never leaves a half-written sidecar
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)
}

fn touch(filename: &Path) -> io::Result<()> {
    fs::File::options()
        .write(true)
        .open(filename)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn media_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"not really audio").unwrap();
        path
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/music/a.flac")),
            PathBuf::from("/music/a.flac.tags.json")
        );
    }

    #[test]
    fn test_read_missing_file_is_none() {
        let service = SidecarTagService::new();
        assert_eq!(service.read_file(Path::new("/nonexistent/song.mp3")), None);
    }

    #[test]
    fn test_read_file_without_sidecar() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "song.mp3");

        let metadata = SidecarTagService::new().read_file(&file).unwrap();
        assert!(metadata.valid);
        assert_eq!(metadata.basefilename, "song.mp3");
        assert_eq!(metadata.filesize, 16);
        assert_eq!(metadata.file_type, FileType::Mpeg);
        assert!(metadata.mtime.is_some());
        assert!(metadata.title.is_empty());
        assert_eq!(metadata.art_automatic, None);
    }

    #[test]
    fn test_read_non_media_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "notes.txt");

        let metadata = SidecarTagService::new().read_file(&file).unwrap();
        assert!(!metadata.valid);
        assert_eq!(metadata.file_type, FileType::Unknown);
    }

    #[test]
    fn test_save_then_read_keeps_statistics() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "song.flac");
        let service = SidecarTagService::new();

        let response = service.handle_request(TagRequest::UpdateSongStatistics {
            filename: file.clone(),
            playcount: 7,
            skipcount: 1,
            lastplayed: None,
            score: 42,
        });
        assert_eq!(response, TagResponse::UpdateSongStatistics { success: true });

        let metadata = SongMetadata {
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            year: 2001,
            track: 3,
            playcount: 999,
            ..SongMetadata::default()
        };
        assert!(service.save_file(&file, &metadata));

        let read = service.read_file(&file).unwrap();
        assert_eq!(read.title, "Title");
        assert_eq!(read.artist, "Artist");
        assert_eq!(read.year, 2001);
        assert_eq!(read.track, 3);
        // Statistics come from the statistics update, not the saved tags
        assert_eq!(read.playcount, 7);
        assert_eq!(read.score, 42);
    }

    #[test]
    fn test_save_refused_for_missing_file() {
        let service = SidecarTagService::new();
        assert!(!service.save_file(Path::new("/nonexistent/a.mp3"), &SongMetadata::default()));
    }

    #[test]
    fn test_rating_update() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "song.ogg");
        let service = SidecarTagService::new();

        let response = service.handle_request(TagRequest::UpdateSongRating {
            filename: file.clone(),
            rating: Some(0.6),
        });
        assert_eq!(response, TagResponse::UpdateSongRating { success: true });
        assert_eq!(service.read_file(&file).unwrap().rating, Some(0.6));
    }

    #[test]
    fn test_embedded_art() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "song.m4a");
        let service = SidecarTagService::new();

        assert!(service.load_embedded_art(&file).is_empty());
        assert!(service.save_embedded_art(&file, &[0xff, 0xd8, 0xff]));
        assert_eq!(service.load_embedded_art(&file), vec![0xff, 0xd8, 0xff]);
        assert_eq!(
            service.read_file(&file).unwrap().art_automatic.as_deref(),
            Some(EMBEDDED_COVER)
        );
    }

    #[test]
    fn test_corrupt_sidecar_marks_invalid() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "song.wav");
        fs::write(sidecar_path(&file), b"{ not json").unwrap();

        let metadata = SidecarTagService::new().read_file(&file).unwrap();
        assert!(!metadata.valid);
    }

    #[test]
    fn test_is_media_file() {
        let dir = TempDir::new().unwrap();
        let service = SidecarTagService::new();

        assert!(service.is_media_file(&media_file(&dir, "a.flac")));
        assert!(!service.is_media_file(&media_file(&dir, "a.txt")));
        assert!(!service.is_media_file(&dir.path().join("missing.mp3")));
        assert!(!service.is_media_file(dir.path()));
    }

    #[test]
    fn test_worker_service_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = media_file(&dir, "a.mp3");
        let service = SidecarTagService::new();

        let request = serde_json::to_vec(&TagRequest::IsMediaFile { filename: file }).unwrap();
        let response: TagResponse = serde_json::from_slice(&service.handle(&request).unwrap()).unwrap();
        assert_eq!(response, TagResponse::IsMediaFile { success: true });
    }

    #[test]
    fn test_worker_service_rejects_garbage() {
        let response = SidecarTagService::new().handle(b"garbage").unwrap();
        let response: TagResponse = serde_json::from_slice(&response).unwrap();
        assert!(matches!(response, TagResponse::Error { .. }));
    }
}
