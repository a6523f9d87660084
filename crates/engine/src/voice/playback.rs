use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_storage::BoxFuture;
use snafu::{ResultExt, ensure};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::speech::AudioClip;
use crate::error::{ProcessFailedSnafu, SpawnProcessSnafu, StageClipSnafu, VoiceResult};

/// Handle to one clip being played.
pub trait Playback: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    /// Resolves once playback ends for any reason, including `stop`.
    fn finished(&self) -> BoxFuture<'static, ()>;
}

/// Audio sink. `play` must return promptly; playback runs in the background.
pub trait AudioOutput: Send + Sync {
    fn play(&self, clip: AudioClip) -> VoiceResult<Arc<dyn Playback>>;
}

/// Plays clips through an external player, e.g. `ffplay -nodisp -autoexit`.
/// Pause and resume send `SIGSTOP`/`SIGCONT` to the player process.
pub struct CommandAudioOutput {
    command: Vec<String>,
    staging_dir: PathBuf,
    sequence: AtomicU64,
}

impl CommandAudioOutput {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            staging_dir: std::env::temp_dir(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_staging_dir(mut self, staging_dir: PathBuf) -> Self {
        self.staging_dir = staging_dir;
        self
    }

    fn stage_clip(&self, clip: &AudioClip) -> VoiceResult<PathBuf> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self.staging_dir.join(format!(
            "parley-{}-{sequence}.{}",
            std::process::id(),
            clip.extension()
        ));
        std::fs::write(&path, &clip.bytes).context(StageClipSnafu {
            stage: "stage-audio-clip",
            path: path.clone(),
        })?;
        Ok(path)
    }
}

impl AudioOutput for CommandAudioOutput {
    fn play(&self, clip: AudioClip) -> VoiceResult<Arc<dyn Playback>> {
        let Some((program, args)) = self.command.split_first() else {
            return ProcessFailedSnafu {
                stage: "player-command",
                program: String::new(),
                details: "no player command configured".to_string(),
            }
            .fail();
        };

        let path = self.stage_clip(&clip)?;
        let spawned = Command::new(program)
            .args(args)
            .arg(&path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let _ = std::fs::remove_file(&path);
                return Err(source).context(SpawnProcessSnafu {
                    stage: "player-spawn",
                    program: program.clone(),
                });
            }
        };

        let playback = Arc::new(ProcessPlayback {
            pid: child.id(),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        let stop = playback.stop.clone();
        let done = playback.done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    if let Err(error) = child.kill().await {
                        tracing::debug!(error = %error, "player already exited");
                    }
                }
                status = child.wait() => {
                    if let Err(error) = status {
                        tracing::warn!(error = %error, "waiting on player failed");
                    }
                }
            }
            if let Err(error) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = ?path, error = %error, "staged clip already removed");
            }
            done.cancel();
        });

        Ok(playback)
    }
}

struct ProcessPlayback {
    pid: Option<u32>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl ProcessPlayback {
    fn signal(&self, signal: &str) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(error) = send_signal(pid, signal) {
            tracing::warn!(pid, signal, error = %error, "cannot signal player");
        }
    }
}

impl Playback for ProcessPlayback {
    fn pause(&self) {
        self.signal("-STOP");
    }

    fn resume(&self) {
        self.signal("-CONT");
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn finished(&self) -> BoxFuture<'static, ()> {
        let done = self.done.clone();
        Box::pin(async move { done.cancelled().await })
    }
}

fn send_signal(pid: u32, signal: &str) -> VoiceResult<()> {
    let status = std::process::Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
        .context(SpawnProcessSnafu {
            stage: "player-signal",
            program: "kill".to_string(),
        })?;
    ensure!(
        status.success(),
        ProcessFailedSnafu {
            stage: "player-signal",
            program: "kill".to_string(),
            details: format!("kill {signal} {pid} exited with {status}"),
        }
    );
    Ok(())
}
