use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
};

use async_trait::async_trait;

use crate::session::StreamAddress;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("Could not start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exited { program: String, status: ExitStatus },
}

/// Something that records a live stream into a file.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Record `input` into `output`, returning once recording has ended.
    async fn capture(&self, input: &StreamAddress, output: &Path) -> Result<(), SinkError>;
}

/// Records by remuxing the stream with an `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, input: &StreamAddress, output: &Path) -> tokio::process::Command {
        let mut child = tokio::process::Command::new(&self.program);

        child
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(input.as_str())
            .arg("-c")
            .arg("copy")
            .arg(output);

        child
    }
}

#[async_trait]
impl MediaSink for Ffmpeg {
    async fn capture(&self, input: &StreamAddress, output: &Path) -> Result<(), SinkError> {
        let program = self.program.display().to_string();
        info!("Recording {} to {}", input, output.display());

        let status = self
            .command(input, output)
            .spawn()
            .map_err(|source| SinkError::Spawn {
                program: program.clone(),
                source,
            })?
            .wait()
            .await
            .map_err(|source| SinkError::Spawn {
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SinkError::Exited { program, status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_args() {
        let ffmpeg = Ffmpeg::default();
        let command = ffmpeg.command(
            &StreamAddress("https://example/master.m3u8".to_string()),
            Path::new("out/live.ts"),
        );

        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.as_std().get_program(), "ffmpeg");
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-i",
                "https://example/master.m3u8",
                "-c",
                "copy",
                "out/live.ts"
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary() {
        let ffmpeg = Ffmpeg::new("/nonexistent/ffmpeg");
        let err = ffmpeg
            .capture(&StreamAddress("x".to_string()), Path::new("out.ts"))
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Spawn { .. }));
    }
}
