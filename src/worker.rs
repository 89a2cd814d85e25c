use std::path::{Path, PathBuf};

use crate::{
    availability::AccessLevel,
    comments::CommentCapture,
    ffmpeg::{MediaSink, SinkError},
    live_info::{self, LiveId, LiveInfo, LiveInfoError},
    session::{SessionConfig, SessionError, StreamSession},
    util::{self, NicoApi},
};

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "{title}-{id}.ts";
const COMMENT_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteDecision {
    Proceed,
    Abort,
}

/// Asked before an existing recording would be overwritten.
pub trait OverwritePolicy: Send + Sync {
    fn decide(&self, path: &Path) -> OverwriteDecision;
}

impl<F> OverwritePolicy for F
where
    F: Fn(&Path) -> OverwriteDecision + Send + Sync,
{
    fn decide(&self, path: &Path) -> OverwriteDecision {
        self(path)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Output path template; `{title}` and `{id}` are substituted.
    pub output: String,
    pub save_comments: bool,
    pub session: SessionConfig,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output: DEFAULT_OUTPUT_TEMPLATE.to_string(),
            save_comments: false,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResult {
    Completed {
        video: PathBuf,
        comments: Option<PathBuf>,
        /// `Partial` when only the trial watch part could be recorded.
        access: AccessLevel,
    },
    /// The destination existed and the overwrite policy said no.
    Skipped { video: PathBuf },
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    LiveInfo(#[from] LiveInfoError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Recording failed")]
    Sink(#[from] SinkError),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

pub fn output_path(template: &str, info: &LiveInfo) -> PathBuf {
    PathBuf::from(
        template
            .replace("{title}", &util::sanitize_filename(&info.title))
            .replace("{id}", info.id.as_str()),
    )
}

/// The comment log lives next to the video, with the same stem.
pub fn comment_path(video: &Path) -> PathBuf {
    video.with_extension(COMMENT_EXTENSION)
}

async fn start_comments(session: &StreamSession, video: &Path) -> Option<CommentCapture> {
    let room = match session.await_room().await {
        Ok(room) => room,
        Err(e) => {
            warn!("Not saving comments: {}", e);
            return None;
        }
    };

    Some(CommentCapture::start(&room, &comment_path(video)))
}

/// Stop the comment capture; its log only counts as saved if it ran cleanly.
async fn finish_comments(capture: &CommentCapture) -> Option<PathBuf> {
    match capture.close().await {
        Ok(_) => Some(capture.destination().to_path_buf()),
        Err(e) => {
            warn!("Comment capture failed: {}", e);
            None
        }
    }
}

/// Record one broadcast from start to finish.
///
/// Comments are only requested once the control channel has announced the
/// room, and the sink is only started once it has announced the stream. The
/// session is closed before returning, whatever the outcome.
pub async fn run(
    api: &dyn NicoApi,
    sink: &dyn MediaSink,
    overwrite: &dyn OverwritePolicy,
    input: &str,
    options: &DownloadOptions,
) -> Result<DownloadResult, DownloadError> {
    let live_id = LiveId::parse(input);
    let info = live_info::resolve(api, &live_id).await?;
    info!("Live {}: {}", info.id, info.title);

    let video = output_path(&options.output, &info);
    if tokio::fs::try_exists(&video).await?
        && overwrite.decide(&video) == OverwriteDecision::Abort
    {
        info!("Not overwriting {}", video.display());
        return Ok(DownloadResult::Skipped { video });
    }
    if let Some(parent) = video.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let session = StreamSession::connect(&info.web_socket_url, options.session.clone());

    let comments = async {
        if options.save_comments {
            start_comments(&session, &video).await
        } else {
            None
        }
    };
    let (comments, stream) = tokio::join!(comments, session.await_stream_address());

    let recorded = match stream {
        Ok(stream) => sink
            .capture(&stream, &video)
            .await
            .map_err(DownloadError::from),
        Err(e) => Err(e.into()),
    };

    let comments = match &comments {
        Some(capture) => finish_comments(capture).await,
        None => None,
    };
    if let Err(e) = session.close().await {
        error!("Control channel for {} failed: {}", info.id, e);
    }

    recorded?;
    info!("Saved {}", video.display());

    Ok(DownloadResult::Completed {
        video,
        comments,
        access: info.access,
    })
}
