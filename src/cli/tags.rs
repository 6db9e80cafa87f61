// ABOUTME: CLI tag commands: read, is-media, art, rate
//
// Requests for several files are issued together so they spread over the
// workers, then awaited in order.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use super::{ArtArgs, FilesArgs, OutputFormat, RateArgs};
use crate::tagreader::{Song, SongMetadata, TagReaderClient, TagResponse};

/// JSON output for the read command
#[derive(Debug, Serialize)]
pub struct ReadOutput {
    /// File as given on the command line
    pub file: PathBuf,
    /// `None` when the worker could not read the file
    pub metadata: Option<SongMetadata>,
}

/// JSON output for the is-media command
#[derive(Debug, Serialize)]
pub struct IsMediaOutput {
    /// File as given on the command line
    pub file: PathBuf,
    /// Whether the file can carry tags
    pub is_media: bool,
}

/// Print the tags of every file in `args`
pub async fn read(client: &TagReaderClient, args: FilesArgs, format: OutputFormat) -> Result<()> {
    let replies: Vec<_> = args.files.iter().map(|file| client.read_file(file)).collect();

    let mut outputs = Vec::with_capacity(replies.len());
    for (file, reply) in args.files.into_iter().zip(replies) {
        let metadata = match reply.wait().await {
            Ok(TagResponse::ReadFile { metadata }) => metadata,
            Ok(other) => bail!("unexpected {} response for {}", other.kind(), file.display()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
        };
        outputs.push(ReadOutput { file, metadata });
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outputs)?),
        OutputFormat::Text => {
            for output in &outputs {
                print_metadata(output);
            }
        }
    }

    if outputs.iter().all(|o| o.metadata.is_none()) {
        bail!("No readable files");
    }
    Ok(())
}

/// Report which files are media files
pub async fn is_media(client: &TagReaderClient, args: FilesArgs, format: OutputFormat) -> Result<()> {
    let replies: Vec<_> = args.files.iter().map(|file| client.is_media_file(file)).collect();

    let mut outputs = Vec::with_capacity(replies.len());
    for (file, reply) in args.files.into_iter().zip(replies) {
        let is_media = match reply.wait().await {
            Ok(TagResponse::IsMediaFile { success }) => success,
            Ok(other) => bail!("unexpected {} response for {}", other.kind(), file.display()),
            Err(e) => return Err(e).with_context(|| format!("Failed to check {}", file.display())),
        };
        outputs.push(IsMediaOutput { file, is_media });
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outputs)?),
        OutputFormat::Text => {
            for output in &outputs {
                println!("{}\t{}", output.file.display(), if output.is_media { "yes" } else { "no" });
            }
        }
    }
    Ok(())
}

/// Extract a file's embedded cover, optionally writing it to disk
pub async fn art(client: &TagReaderClient, args: ArtArgs, format: OutputFormat) -> Result<()> {
    let data = match client.load_embedded_art(&args.file).wait().await {
        Ok(TagResponse::LoadEmbeddedArt { data }) => data,
        Ok(other) => bail!("unexpected {} response", other.kind()),
        Err(e) => return Err(e).with_context(|| format!("Failed to load art from {}", args.file.display())),
    };

    if data.is_empty() {
        bail!("{} has no embedded cover", args.file.display());
    }

    if let Some(output) = &args.output {
        tokio::fs::write(output, &data)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
    }

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "file": args.file, "bytes": data.len(), "output": args.output })
        ),
        OutputFormat::Text => match &args.output {
            Some(output) => println!("Wrote {} bytes to {}", data.len(), output.display()),
            None => println!("{}: {} bytes of embedded art", args.file.display(), data.len()),
        },
    }
    Ok(())
}

/// Set the rating of one file
pub async fn rate(client: &TagReaderClient, args: RateArgs, format: OutputFormat) -> Result<()> {
    let song = Song {
        rating: Some(args.rating),
        ..Song::new(&args.file)
    };

    let stored = match client.update_song_rating(&song).wait().await {
        Ok(TagResponse::UpdateSongRating { success }) => success,
        Ok(other) => bail!("unexpected {} response", other.kind()),
        Err(e) => return Err(e).with_context(|| format!("Failed to rate {}", args.file.display())),
    };

    if !stored {
        bail!("Rating was not stored for {}", args.file.display());
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "file": args.file, "rating": args.rating })),
        OutputFormat::Text => println!("Rated {} {:.2}", args.file.display(), args.rating),
    }
    Ok(())
}

fn print_metadata(output: &ReadOutput) {
    let Some(metadata) = &output.metadata else {
        println!("{}: not readable", output.file.display());
        return;
    };

    println!("{}", output.file.display());
    if !metadata.valid {
        println!("  (no tags)");
    }

    let fields = [
        ("title", metadata.title.clone()),
        ("artist", metadata.artist.clone()),
        ("album", metadata.album.clone()),
        ("genre", metadata.genre.clone()),
        ("year", non_zero(metadata.year)),
        ("track", non_zero(metadata.track)),
        ("disc", non_zero(metadata.disc)),
        ("rating", metadata.rating.map(|r| format!("{r:.2}")).unwrap_or_default()),
        ("playcount", non_zero(metadata.playcount)),
    ];
    for (name, value) in fields.iter().filter(|(_, v)| !v.is_empty()) {
        println!("  {name:<10} {value}");
    }
    println!("  {:<10} {:?}, {} bytes", "file", metadata.file_type, metadata.filesize);
}

fn non_zero<T: PartialEq + Default + std::fmt::Display>(value: T) -> String {
    if value == T::default() {
        String::new()
    } else {
        value.to_string()
    }
}
