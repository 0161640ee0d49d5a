//! Parsing of ffmpeg progress lines from stderr.

/// Fields of an ffmpeg progress line (`frame= .. fps= .. time= .. bitrate= ..`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressLine {
    pub frame: Option<String>,
    pub fps: Option<String>,
    pub time: Option<String>,
    pub bitrate: Option<String>,
    pub speed: Option<String>,
    pub drop: Option<String>,
}

impl ProgressLine {
    /// Parse a stderr line. Returns `None` for anything that is not progress.
    pub fn parse(line: &str) -> Option<Self> {
        if !(line.contains("time=") && line.contains("bitrate=")) {
            return None;
        }

        Some(Self {
            frame: extract_value(line, "frame="),
            fps: extract_value(line, "fps="),
            time: extract_value(line, "time="),
            bitrate: extract_value(line, "bitrate="),
            speed: extract_value(line, "speed="),
            drop: extract_value(line, "drop="),
        })
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "??".to_string());
        let mut msg = format!(
            "time={} bitrate={} speed={}",
            field(&self.time),
            field(&self.bitrate),
            field(&self.speed)
        );
        if let Some(fps) = &self.fps {
            msg.push_str(&format!(" fps={fps}"));
        }
        if let Some(drop) = &self.drop {
            msg.push_str(&format!(" drop={drop}"));
        }
        msg
    }
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let after_key = line[start + key.len()..].trim_start();
    let end = after_key
        .find(char::is_whitespace)
        .unwrap_or(after_key.len());
    if end == 0 {
        return None;
    }
    Some(after_key[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_progress() {
        let line = "frame= 123 fps= 60.0 q=28.0 size= 1024kB time=00:00:10.00 bitrate= 2000.0kbits/s drop=2 speed= 1.0x";
        let progress = ProgressLine::parse(line).unwrap();

        assert_eq!(progress.frame.as_deref(), Some("123"));
        assert_eq!(progress.fps.as_deref(), Some("60.0"));
        assert_eq!(progress.time.as_deref(), Some("00:00:10.00"));
        assert_eq!(progress.bitrate.as_deref(), Some("2000.0kbits/s"));
        assert_eq!(progress.drop.as_deref(), Some("2"));
        assert_eq!(progress.speed.as_deref(), Some("1.0x"));
    }

    #[test]
    fn test_non_progress_lines_ignored() {
        assert!(ProgressLine::parse("Input #0, x11grab, from ':0.0':").is_none());
        assert!(ProgressLine::parse("").is_none());
    }

    #[test]
    fn test_summary_marks_missing_fields() {
        let progress = ProgressLine::parse("size= 512kB time=00:00:30.00 bitrate= 128.0kbits/s").unwrap();
        assert_eq!(progress.summary(), "time=00:00:30.00 bitrate=128.0kbits/s speed=??");
    }
}
