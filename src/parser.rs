use crate::now_ms;
use crate::throttle::ProgressThrottle;
use regex::Regex;
use std::sync::OnceLock;

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mkv"];

/// Which yt-dlp line shape matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Progress,
    Destination,
    Merger,
    AlreadyDownloaded,
    PostProcessor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Progress the caller should persist; the throttle has already been advanced.
    Progress(f64),
    /// Progress line that was parsed but must not be written.
    ProgressSkipped(f64),
    Filename { kind: LineKind, filename: String },
}

/// Ordered: the first matching pattern decides what a line means.
fn line_patterns() -> &'static [(Regex, LineKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, LineKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").unwrap(),
                LineKind::Progress,
            ),
            (
                Regex::new(r"^\[download\] Destination: (.+)$").unwrap(),
                LineKind::Destination,
            ),
            (
                Regex::new(r#"^\[Merger\] Merging formats into "?(.+?)"?$"#).unwrap(),
                LineKind::Merger,
            ),
            (
                Regex::new(r"^\[download\] (.+) has already been downloaded(?: and merged)?$")
                    .unwrap(),
                LineKind::AlreadyDownloaded,
            ),
            (
                Regex::new(r"^\[\w+\] (?:.*?; )?(?:Destination|Writing [^:]+? to): (.+)$")
                    .unwrap(),
                LineKind::PostProcessor,
            ),
        ]
    })
}

/// Incremental recognizer for yt-dlp console output.
///
/// The only state carried between lines is the best-known output filename
/// (later merger/post-processor lines supersede earlier destinations) and the
/// progress throttle for the task being parsed.
#[derive(Debug, Clone, Default)]
pub struct OutputParser {
    filename: Option<String>,
    throttle: ProgressThrottle,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn parse_line(&mut self, line: &str) -> Option<LineEvent> {
        self.parse_line_at(line, now_ms())
    }

    pub fn parse_line_at(&mut self, line: &str, now_ms: i64) -> Option<LineEvent> {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.is_empty() {
            return None;
        }

        for (re, kind) in line_patterns() {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let value = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();

            if *kind == LineKind::Progress {
                let Ok(percent) = value.parse::<f64>() else {
                    return None;
                };
                let percent = percent.clamp(0.0, 100.0);
                let tracking_video = self.filename.as_deref().is_some_and(is_video_file);
                if tracking_video && self.throttle.should_update_at(percent, now_ms) {
                    self.throttle.update_at(percent, now_ms);
                    return Some(LineEvent::Progress(percent));
                }
                return Some(LineEvent::ProgressSkipped(percent));
            }

            let filename = value.trim_matches('"').to_string();
            if filename.is_empty() {
                return None;
            }
            self.filename = Some(filename.clone());
            return Some(LineEvent::Filename {
                kind: *kind,
                filename,
            });
        }
        None
    }
}

pub fn is_video_file(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 10_000_000;

    fn parser_tracking(filename: &str) -> OutputParser {
        let mut parser = OutputParser::new();
        parser.parse_line_at(&format!("[download] Destination: {filename}"), NOW);
        parser
    }

    #[test]
    fn progress_on_video_destination_is_persisted() {
        let mut parser = parser_tracking("A.mp4");
        assert_eq!(
            parser.parse_line_at("[download]  42.5%", NOW),
            Some(LineEvent::Progress(42.5))
        );
    }

    #[test]
    fn progress_on_thumbnail_destination_is_not_persisted() {
        let mut parser = parser_tracking("A.jpg");
        assert_eq!(
            parser.parse_line_at("[download]  42.5%", NOW),
            Some(LineEvent::ProgressSkipped(42.5))
        );
    }

    #[test]
    fn progress_before_any_destination_is_not_persisted() {
        let mut parser = OutputParser::new();
        assert_eq!(
            parser.parse_line_at("[download]  10.0% of 5.00MiB at 1.00MiB/s ETA 00:04", NOW),
            Some(LineEvent::ProgressSkipped(10.0))
        );
    }

    #[test]
    fn throttled_progress_is_skipped_until_window_passes() {
        let mut parser = parser_tracking("clip.webm");
        assert_eq!(
            parser.parse_line_at("[download]   1.0%", NOW),
            Some(LineEvent::Progress(1.0))
        );
        assert_eq!(
            parser.parse_line_at("[download]   2.0%", NOW + 10),
            Some(LineEvent::ProgressSkipped(2.0))
        );
        assert_eq!(
            parser.parse_line_at("[download]   2.5%", NOW + 1_500),
            Some(LineEvent::Progress(2.5))
        );
        assert_eq!(
            parser.parse_line_at("[download] 100% of 5.00MiB in 00:03", NOW + 1_501),
            Some(LineEvent::Progress(100.0))
        );
    }

    #[test]
    fn each_filename_pattern_is_recognized() {
        let cases = [
            ("[download] Destination: My Video [A].f137.mp4", LineKind::Destination, "My Video [A].f137.mp4"),
            (r#"[Merger] Merging formats into "My Video [A].mkv""#, LineKind::Merger, "My Video [A].mkv"),
            ("[download] My Video [A].mp4 has already been downloaded", LineKind::AlreadyDownloaded, "My Video [A].mp4"),
            ("[ExtractAudio] Destination: My Video [A].mp3", LineKind::PostProcessor, "My Video [A].mp3"),
            ("[info] Writing video description to: My Video [A].description", LineKind::PostProcessor, "My Video [A].description"),
            ("[info] Writing video metadata as JSON to: My Video [A].info.json", LineKind::PostProcessor, "My Video [A].info.json"),
            ("[VideoRemuxer] Remuxing video from webm to mp4; Destination: My Video [A].mp4", LineKind::PostProcessor, "My Video [A].mp4"),
        ];
        for (line, kind, expected) in cases {
            let mut parser = OutputParser::new();
            assert_eq!(
                parser.parse_line_at(line, NOW),
                Some(LineEvent::Filename {
                    kind,
                    filename: expected.to_string()
                }),
                "line: {line}"
            );
            assert_eq!(parser.filename(), Some(expected));
        }
    }

    #[test]
    fn last_filename_line_wins() {
        let mut parser = OutputParser::new();
        parser.parse_line_at("[download] Destination: A.f137.mp4", NOW);
        parser.parse_line_at(r#"[Merger] Merging formats into "A.mkv""#, NOW);
        parser.parse_line_at("[download] A.webm has already been downloaded", NOW);
        assert_eq!(parser.filename(), Some("A.webm"));
    }

    #[test]
    fn unrelated_lines_leave_state_alone() {
        let mut parser = parser_tracking("A.mp4");
        assert_eq!(parser.parse_line_at("[youtube] A: Downloading webpage", NOW), None);
        assert_eq!(parser.parse_line_at("WARNING: something odd", NOW), None);
        assert_eq!(parser.parse_line_at("", NOW), None);
        assert_eq!(parser.filename(), Some("A.mp4"));
    }

    #[test]
    fn carriage_return_terminated_progress_is_parsed() {
        let mut parser = parser_tracking("A.mkv");
        assert_eq!(
            parser.parse_line_at("[download]  55.0% of 1.00GiB\r", NOW),
            Some(LineEvent::Progress(55.0))
        );
    }

    #[test]
    fn video_extension_check_is_case_insensitive() {
        assert!(is_video_file("x.MP4"));
        assert!(is_video_file("dir/x.webm"));
        assert!(!is_video_file("x.jpg"));
        assert!(!is_video_file("x.info.json"));
        assert!(!is_video_file("mp4"));
    }
}
