use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_THREAD_POOL_SIZE: usize = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverwritePolicy {
    Force,
    Skip,
    #[default]
    Default,
}

/// Effective settings for one tick or one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedConfiguration {
    pub thread_pool_size: usize,
    pub poll_interval_secs: u64,
    /// Root for per-video output folders; `None` means `<base>/downloads`.
    pub download_root: Option<PathBuf>,
    /// yt-dlp executable override; `None` means bundled or PATH lookup.
    pub binary_path: Option<PathBuf>,
    pub format: Option<String>,
    pub format_sort: Option<String>,
    pub write_subtitles: bool,
    pub write_auto_subtitles: bool,
    pub subtitle_langs: Option<String>,
    pub embed_subtitles: bool,
    pub extract_audio: bool,
    pub audio_format: Option<String>,
    pub remux_video: Option<String>,
    pub overwrite: OverwritePolicy,
    pub output_template: Option<String>,
    pub use_cookies: bool,
    /// `None` means `<base>/config/cookies.txt`.
    pub cookies_path: Option<PathBuf>,
    /// Pass `--no-progress` and read output in raw chunks.
    pub no_progress: bool,
    pub auto_start: bool,
    pub auto_cleanup: bool,
    pub check_for_updates: bool,
}

impl Default for ResolvedConfiguration {
    fn default() -> Self {
        Self {
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            download_root: None,
            binary_path: None,
            format: None,
            format_sort: None,
            write_subtitles: false,
            write_auto_subtitles: false,
            subtitle_langs: None,
            embed_subtitles: false,
            extract_audio: false,
            audio_format: None,
            remux_video: None,
            overwrite: OverwritePolicy::Default,
            output_template: None,
            use_cookies: false,
            cookies_path: None,
            no_progress: false,
            auto_start: true,
            auto_cleanup: false,
            check_for_updates: true,
        }
    }
}

impl ResolvedConfiguration {
    pub fn effective_download_root(&self, paths: &AppPaths) -> PathBuf {
        self.download_root
            .clone()
            .unwrap_or_else(|| paths.default_download_root())
    }

    pub fn effective_cookies_path(&self, paths: &AppPaths) -> PathBuf {
        self.cookies_path
            .clone()
            .unwrap_or_else(|| paths.default_cookies_path())
    }

    pub fn effective_binary(&self, paths: &AppPaths) -> PathBuf {
        self.binary_path.clone().unwrap_or_else(|| paths.ytdlp_cmd())
    }
}

/// Configuration profiles as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProfiles {
    #[serde(default)]
    pub active: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ResolvedConfiguration>,
}

impl DownloadProfiles {
    /// Named profile, then the active profile, then the built-in default.
    pub fn resolve(&self, profile: Option<&str>) -> ResolvedConfiguration {
        let named = profile
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .and_then(|name| self.profiles.get(name));
        if let Some(config) = named {
            return config.clone();
        }
        self.active
            .as_deref()
            .and_then(|name| self.profiles.get(name))
            .cloned()
            .unwrap_or_default()
    }
}

/// Resolves the configuration snapshot a job or tick runs under. Always
/// returns something usable.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, profile: Option<&str>) -> ResolvedConfiguration;
}

/// Reads `config/download_profiles.json` on every call so edits apply on the
/// next tick without a restart.
#[derive(Debug, Clone)]
pub struct FileConfigResolver {
    paths: AppPaths,
}

impl FileConfigResolver {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }
}

impl ConfigResolver for FileConfigResolver {
    fn resolve(&self, profile: Option<&str>) -> ResolvedConfiguration {
        match load_profiles(&self.paths) {
            Ok(profiles) => profiles.resolve(profile),
            Err(err) => {
                log::warn!("falling back to default download configuration: {err}");
                ResolvedConfiguration::default()
            }
        }
    }
}

/// Always hands out the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigResolver {
    pub config: ResolvedConfiguration,
}

impl StaticConfigResolver {
    pub fn new(config: ResolvedConfiguration) -> Self {
        Self { config }
    }
}

impl ConfigResolver for StaticConfigResolver {
    fn resolve(&self, _profile: Option<&str>) -> ResolvedConfiguration {
        self.config.clone()
    }
}

pub fn load_profiles(paths: &AppPaths) -> Result<DownloadProfiles> {
    let path = paths.profiles_path();
    if !path.exists() {
        return Ok(DownloadProfiles::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: DownloadProfiles = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "failed to parse download profiles at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_profiles(paths: &AppPaths, profiles: &DownloadProfiles) -> Result<()> {
    let path = paths.profiles_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(profiles)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
