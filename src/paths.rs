use std::path::PathBuf;

/// On-disk layout of one engine installation.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.config_dir().join("download_profiles.json")
    }

    pub fn default_cookies_path(&self) -> PathBuf {
        self.config_dir().join("cookies.txt")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("engine.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn task_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("tasks")
    }

    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir().join(format!("{task_id}.jsonl"))
    }

    pub fn default_download_root(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn bundled_ytdlp_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("yt-dlp").join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Bundled yt-dlp when present, otherwise whatever `yt-dlp` resolves to on PATH.
    pub fn ytdlp_cmd(&self) -> PathBuf {
        let path = self.bundled_ytdlp_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("yt-dlp")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.task_logs_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }
}
