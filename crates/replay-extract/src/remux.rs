//! Lossless container operations.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::ExtractError;
use crate::ExtractResult;

/// Stream-copy operations used by extraction.
pub trait Remuxer: Send + Sync {
    /// Copy the trailing `duration` of `input` into `output` without
    /// re-encoding. The cut lands on a keyframe.
    fn trim_tail(&self, input: &Path, duration: Duration, output: &Path) -> ExtractResult<()>;

    /// Join the files named in an ffmpeg concat `list` into `output`.
    fn concat(&self, list: &Path, output: &Path) -> ExtractResult<()>;
}

/// [`Remuxer`] backed by the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    program: String,
}

impl FfmpegRemuxer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, step: &'static str, args: &[&str]) -> ExtractResult<()> {
        debug!(step, ?args, "Running remux step");

        let output = Command::new(&self.program)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExtractError::ProcessFailed {
                step,
                code: None,
                detail: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .to_string();
        Err(ExtractError::ProcessFailed {
            step,
            code: output.status.code(),
            detail,
        })
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Remuxer for FfmpegRemuxer {
    #[instrument(name = "remux_trim", skip(self))]
    fn trim_tail(&self, input: &Path, duration: Duration, output: &Path) -> ExtractResult<()> {
        let offset = format!("-{:.3}", duration.as_secs_f64());
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.run(
            "trim",
            &[
                "-sseof", &offset,
                "-i", &input,
                "-map", "0",
                "-c", "copy",
                "-avoid_negative_ts", "make_zero",
                "-movflags", "+faststart",
                &output,
            ],
        )
    }

    #[instrument(name = "remux_concat", skip(self))]
    fn concat(&self, list: &Path, output: &Path) -> ExtractResult<()> {
        let list = list.to_string_lossy();
        let output = output.to_string_lossy();
        self.run(
            "concat",
            &["-f", "concat", "-safe", "0", "-i", &list, "-c", "copy", &output],
        )
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_ffmpeg(dir: &tempfile::TempDir, body: &str) -> FfmpegRemuxer {
        let path = dir.path().join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        FfmpegRemuxer::new(path.to_string_lossy())
    }

    #[test]
    fn test_trim_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.txt");
        let remuxer = fake_ffmpeg(&dir, &format!("echo \"$@\" > '{}'", log.display()));

        remuxer
            .trim_tail(Path::new("/tmp/in.ts"), Duration::from_secs(30), Path::new("/tmp/out.mp4"))
            .unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.starts_with("-y -hide_banner -loglevel error -sseof -30.000 -i /tmp/in.ts"));
        assert!(args.contains("-c copy"));
        assert!(args.trim_end().ends_with("/tmp/out.mp4"));
    }

    #[test]
    fn test_concat_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.txt");
        let remuxer = fake_ffmpeg(&dir, &format!("echo \"$@\" > '{}'", log.display()));

        remuxer
            .concat(Path::new("/tmp/list.txt"), Path::new("/tmp/joined.ts"))
            .unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.contains("-f concat -safe 0 -i /tmp/list.txt -c copy /tmp/joined.ts"));
    }

    #[test]
    fn test_nonzero_exit_reports_last_stderr_line() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = fake_ffmpeg(&dir, "echo 'first' >&2\necho 'Invalid data found' >&2\nexit 1");

        let err = remuxer
            .concat(Path::new("/tmp/list.txt"), Path::new("/tmp/joined.ts"))
            .unwrap_err();

        match err {
            ExtractError::ProcessFailed { step, code, detail } => {
                assert_eq!(step, "concat");
                assert_eq!(code, Some(1));
                assert_eq!(detail, "Invalid data found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_binary() {
        let remuxer = FfmpegRemuxer::new("/nonexistent/ffmpeg");
        let err = remuxer
            .concat(Path::new("/tmp/list.txt"), Path::new("/tmp/joined.ts"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::ProcessFailed { code: None, .. }));
    }
}
