//! Production download pipeline: resolve a stream URL, stream the body
//! to disk with progress callbacks, post-process, organize.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use super::error::PipelineError;
use super::{PostProcessor, TrackProcessor};
use crate::endpoints::EndpointResolver;
use crate::queue::{ActiveStage, QueueItem, QueueManager};

/// Connect timeout for the stream transfer.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Fallback extension when neither the request nor the stream URL names one.
const DEFAULT_EXTENSION: &str = "mp3";

/// The production track processor.
///
/// Resolves a working stream URL through the endpoint resolver, streams
/// the body to a partial file with chunked progress callbacks, hands the
/// file to the optional post-processor, and moves it to its organized
/// final path.
pub struct TrackPipeline {
    resolver: Arc<EndpointResolver>,
    client: Client,
    output_dir: PathBuf,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl std::fmt::Debug for TrackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackPipeline")
            .field("output_dir", &self.output_dir)
            .field("has_post_processor", &self.post_processor.is_some())
            .finish_non_exhaustive()
    }
}

impl TrackPipeline {
    /// Creates a pipeline writing into `output_dir`.
    ///
    /// The transfer client gets a connect timeout but no overall read
    /// deadline: large tracks on slow mirrors take as long as they take,
    /// and there is no per-item cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Http`] if HTTP client construction fails.
    pub fn new(
        resolver: Arc<EndpointResolver>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .build()?;

        Ok(Self {
            resolver,
            client,
            output_dir: output_dir.into(),
            post_processor: None,
        })
    }

    /// Attaches a post-processor (transcode/tag/organize collaborator).
    #[must_use]
    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Runs the pipeline for one item, returning the final filename and
    /// completion metadata.
    async fn run(
        &self,
        item: &QueueItem,
        manager: &QueueManager,
    ) -> Result<(String, Value), PipelineError> {
        manager
            .update_active_progress(item.track_id, 0, ActiveStage::Starting)
            .await;

        let stream_url = self.resolve_stream_url(item).await?;
        debug!(track_id = item.track_id, "stream URL resolved");

        let partial = self.output_dir.join(format!("{}.part", item.track_id));
        let transfer = self
            .download_stream(&stream_url, &partial, item, manager)
            .await;
        let bytes_downloaded = match transfer {
            Ok(bytes) => bytes,
            Err(error) => {
                remove_partial(&partial).await;
                return Err(error);
            }
        };

        manager
            .update_active_progress(item.track_id, 100, ActiveStage::Transcoding)
            .await;

        let processed = match &self.post_processor {
            Some(post) if item.run_post_process => match post.run(&partial, item).await {
                Ok(path) => path,
                Err(error) => {
                    remove_partial(&partial).await;
                    return Err(error);
                }
            },
            _ => partial.clone(),
        };

        let filename = final_filename(item, &stream_url);
        let destination = self.output_dir.join(&filename);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&processed, &destination).await?;

        let metadata = json!({
            "artist": item.artist,
            "album": item.album,
            "title": item.title,
            "track_number": item.track_number,
            "bytes": bytes_downloaded,
            "quality": item.quality,
        });
        Ok((filename, metadata))
    }

    /// Asks the catalog for a working stream URL for this item.
    async fn resolve_stream_url(&self, item: &QueueItem) -> Result<String, PipelineError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(quality) = &item.quality {
            params.push(("quality", quality.clone()));
        }

        let payload = self
            .resolver
            .resolve_and_call(
                &format!("/track/{}/stream", item.track_id),
                &params,
                "stream_url",
            )
            .await
            .ok_or(PipelineError::NoEndpointData {
                operation: "stream_url",
            })?;

        payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::BadStreamPayload {
                message: format!("missing 'url' field in {payload}"),
            })
    }

    /// Streams the body to `partial`, reporting percent progress as
    /// chunks arrive. Returns the byte count.
    #[instrument(skip(self, item, manager), fields(track_id = item.track_id))]
    async fn download_stream(
        &self,
        url: &str,
        partial: &Path,
        item: &QueueItem,
        manager: &QueueManager,
    ) -> Result<u64, PipelineError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::StreamStatus {
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(partial).await?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();

        let mut bytes_downloaded: u64 = 0;
        let mut last_percent: u8 = 0;
        manager
            .update_active_progress(item.track_id, 0, ActiveStage::Downloading)
            .await;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;

            if let Some(total) = content_length {
                if total > 0 {
                    // Hold 100 back for the transcoding stage
                    #[allow(clippy::cast_possible_truncation)]
                    let percent = ((bytes_downloaded * 100 / total) as u8).min(99);
                    if percent != last_percent {
                        last_percent = percent;
                        manager
                            .update_active_progress(item.track_id, percent, ActiveStage::Downloading)
                            .await;
                    }
                }
            }
        }

        writer.flush().await?;
        Ok(bytes_downloaded)
    }
}

#[async_trait]
impl TrackProcessor for TrackPipeline {
    async fn process(&self, item: QueueItem, manager: Arc<QueueManager>) {
        match self.run(&item, &manager).await {
            Ok((filename, metadata)) => {
                if let Err(error) = manager.mark_completed(item.track_id, &filename, metadata).await
                {
                    warn!(track_id = item.track_id, error = %error, "failed to record completion");
                }
            }
            Err(error) => {
                if let Err(mark_error) =
                    manager.mark_failed(item.track_id, &error.to_string()).await
                {
                    warn!(track_id = item.track_id, error = %mark_error, "failed to record failure");
                }
            }
        }
    }
}

/// Best-effort removal of a partially written file.
async fn remove_partial(partial: &Path) {
    if let Err(error) = tokio::fs::remove_file(partial).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %error, "failed to remove partial file");
        }
    }
}

/// Computes the final relative filename for an item.
///
/// The organization template, when present, substitutes
/// `{artist}`/`{album}`/`{title}`/`{track_number}` tokens and may
/// contain directory separators; otherwise the flat
/// `Artist - Title.ext` form is used.
fn final_filename(item: &QueueItem, stream_url: &str) -> String {
    let extension = item
        .convert_to
        .clone()
        .or_else(|| extension_from_url(stream_url))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    let stem = match &item.organize_template {
        Some(template) => render_template(template, item),
        None => format!(
            "{} - {}",
            sanitize_component(&item.artist),
            sanitize_component(&item.title)
        ),
    };

    format!("{stem}.{extension}")
}

/// Substitutes template tokens; each substituted value is sanitized so
/// it cannot introduce extra path components.
fn render_template(template: &str, item: &QueueItem) -> String {
    template
        .replace("{artist}", &sanitize_component(&item.artist))
        .replace(
            "{album}",
            &sanitize_component(item.album.as_deref().unwrap_or("Unknown Album")),
        )
        .replace("{title}", &sanitize_component(&item.title))
        .replace(
            "{track_number}",
            &item
                .track_number
                .map_or_else(|| "00".to_string(), |n| format!("{n:02}")),
        )
}

/// Strips path separators and control characters from one component.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Pulls a plausible audio extension off the stream URL path.
fn extension_from_url(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok()?.path().to_string();
    let extension = Path::new(&path).extension()?.to_str()?.to_ascii_lowercase();
    let known = ["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav"];
    known.contains(&extension.as_str()).then_some(extension)
}
