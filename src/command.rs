use crate::config::{OverwritePolicy, ResolvedConfiguration};
use std::path::{Path, PathBuf};

const MAX_TITLE_CHARS: usize = 150;

/// Everything the download argv depends on besides the configuration.
#[derive(Debug, Clone)]
pub struct DownloadCommand<'a> {
    pub config: &'a ResolvedConfiguration,
    pub url: &'a str,
    /// Cookie file to pass, already checked to exist.
    pub cookies_file: Option<&'a Path>,
    /// Result of the `--list-subs` probe; only consulted for manual subtitles.
    pub subtitles_available: bool,
}

impl DownloadCommand<'_> {
    /// yt-dlp arguments, URL last. Same inputs always produce the same argv.
    pub fn args(&self) -> Vec<String> {
        let config = self.config;
        let mut args: Vec<String> = Vec::new();

        if let Some(format) = non_empty(&config.format) {
            args.push("-f".to_string());
            args.push(format.to_string());
        }
        if let Some(sort) = non_empty(&config.format_sort) {
            args.push("-S".to_string());
            args.push(sort.to_string());
        }

        let manual_subs = config.write_subtitles && self.subtitles_available;
        if manual_subs {
            args.push("--write-subs".to_string());
        }
        if config.write_auto_subtitles {
            args.push("--write-auto-subs".to_string());
        }
        if manual_subs || config.write_auto_subtitles {
            if let Some(langs) = non_empty(&config.subtitle_langs) {
                args.push("--sub-langs".to_string());
                args.push(langs.to_string());
            }
            if config.embed_subtitles {
                args.push("--embed-subs".to_string());
            }
        }

        if let Some(cookies) = self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }

        if config.extract_audio {
            args.push("-x".to_string());
            if let Some(audio_format) = non_empty(&config.audio_format) {
                args.push("--audio-format".to_string());
                args.push(audio_format.to_string());
            }
        }
        if let Some(container) = non_empty(&config.remux_video) {
            args.push("--remux-video".to_string());
            args.push(container.to_string());
        }

        match config.overwrite {
            OverwritePolicy::Force => args.push("--force-overwrites".to_string()),
            OverwritePolicy::Skip => args.push("--no-overwrites".to_string()),
            OverwritePolicy::Default => {}
        }

        if let Some(template) = non_empty(&config.output_template) {
            args.push("-o".to_string());
            args.push(template.to_string());
        }

        args.push("--write-info-json".to_string());
        if config.no_progress {
            args.push("--no-progress".to_string());
        } else {
            args.push("--newline".to_string());
        }

        args.push(self.url.to_string());
        args
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn subtitle_probe_args(url: &str) -> Vec<String> {
    vec![
        "--list-subs".to_string(),
        "--skip-download".to_string(),
        url.to_string(),
    ]
}

pub fn update_check_args() -> Vec<String> {
    vec!["-U".to_string()]
}

/// Reads `--list-subs` output; automatic captions alone do not count.
pub fn subtitles_available(probe_output: &str) -> bool {
    if probe_output.contains("has no subtitles") {
        return false;
    }
    probe_output.contains("Available subtitles for")
}

/// Makes `title` usable as one path component on every platform.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    let trimmed = out.trim().trim_end_matches('.').trim();
    let limited: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    let limited = limited.trim_end().to_string();
    if limited.is_empty() {
        "untitled".to_string()
    } else {
        limited
    }
}

/// `<root>/<sanitized title> [<video id>]`
pub fn output_dir(download_root: &Path, title: &str, video_id: &str) -> PathBuf {
    download_root.join(format!(
        "{} [{}]",
        sanitize_title(title),
        sanitize_title(video_id)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(config: &ResolvedConfiguration, cookies: Option<&Path>, subs: bool) -> Vec<String> {
        DownloadCommand {
            config,
            url: "https://www.youtube.com/watch?v=A",
            cookies_file: cookies,
            subtitles_available: subs,
        }
        .args()
    }

    #[test]
    fn default_config_only_adds_sidecar_and_progress_flags() {
        let args = build(&ResolvedConfiguration::default(), None, false);
        assert_eq!(
            args,
            vec![
                "--write-info-json",
                "--newline",
                "https://www.youtube.com/watch?v=A"
            ]
        );
    }

    #[test]
    fn overwrite_policy_maps_to_single_flag() {
        let mut config = ResolvedConfiguration::default();
        config.overwrite = OverwritePolicy::Force;
        let args = build(&config, None, false);
        assert!(args.contains(&"--force-overwrites".to_string()));
        assert!(!args.contains(&"--no-overwrites".to_string()));

        config.overwrite = OverwritePolicy::Skip;
        let args = build(&config, None, false);
        assert!(args.contains(&"--no-overwrites".to_string()));
        assert!(!args.contains(&"--force-overwrites".to_string()));
    }

    #[test]
    fn full_config_builds_expected_argv_in_order() {
        let config = ResolvedConfiguration {
            format: Some("bv*+ba/b".to_string()),
            format_sort: Some("res:1080".to_string()),
            write_subtitles: true,
            subtitle_langs: Some("en,de".to_string()),
            embed_subtitles: true,
            extract_audio: true,
            audio_format: Some("mp3".to_string()),
            remux_video: Some("mkv".to_string()),
            output_template: Some("%(title)s.%(ext)s".to_string()),
            no_progress: true,
            ..ResolvedConfiguration::default()
        };
        let cookies = Path::new("/cfg/cookies.txt");
        let args = build(&config, Some(cookies), true);
        assert_eq!(
            args,
            vec![
                "-f",
                "bv*+ba/b",
                "-S",
                "res:1080",
                "--write-subs",
                "--sub-langs",
                "en,de",
                "--embed-subs",
                "--cookies",
                "/cfg/cookies.txt",
                "-x",
                "--audio-format",
                "mp3",
                "--remux-video",
                "mkv",
                "-o",
                "%(title)s.%(ext)s",
                "--write-info-json",
                "--no-progress",
                "https://www.youtube.com/watch?v=A",
            ]
        );
    }

    #[test]
    fn manual_subtitles_are_dropped_when_probe_finds_none() {
        let config = ResolvedConfiguration {
            write_subtitles: true,
            subtitle_langs: Some("en".to_string()),
            ..ResolvedConfiguration::default()
        };
        let args = build(&config, None, false);
        assert!(!args.contains(&"--write-subs".to_string()));
        assert!(!args.contains(&"--sub-langs".to_string()));

        let auto = ResolvedConfiguration {
            write_auto_subtitles: true,
            subtitle_langs: Some("en".to_string()),
            ..ResolvedConfiguration::default()
        };
        let args = build(&auto, None, false);
        assert!(args.contains(&"--write-auto-subs".to_string()));
        assert!(args.contains(&"--sub-langs".to_string()));
    }

    #[test]
    fn blank_template_is_ignored() {
        let config = ResolvedConfiguration {
            output_template: Some("   ".to_string()),
            ..ResolvedConfiguration::default()
        };
        assert!(!build(&config, None, false).contains(&"-o".to_string()));
    }

    #[test]
    fn subtitle_probe_output_is_classified() {
        assert!(subtitles_available(
            "[info] Available subtitles for A:\nLanguage Formats\nen vtt"
        ));
        assert!(!subtitles_available("A has no subtitles"));
        assert!(!subtitles_available(
            "[info] Available automatic captions for A:\nen vtt"
        ));
    }

    #[test]
    fn titles_are_sanitized_for_paths() {
        assert_eq!(sanitize_title("a/b\\c: d?"), "a_b_c_ d_");
        assert_eq!(sanitize_title("  trailing dots...  "), "trailing dots");
        assert_eq!(sanitize_title(""), "untitled");
        assert_eq!(sanitize_title("???"), "___");
        assert_eq!(sanitize_title(&"é".repeat(400)).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn output_dir_combines_title_and_video_id() {
        let dir = output_dir(Path::new("/dl"), "My: Video", "A");
        assert_eq!(dir, PathBuf::from("/dl/My_ Video [A]"));
    }
}
