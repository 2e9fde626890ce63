use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Resource limits applied to the execution subprocess.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum address space in MB
    pub memory_mb: usize,
    /// Maximum CPU time in seconds
    pub cpu_seconds: u64,
    /// Maximum number of processes
    pub max_processes: u64,
    /// Thread cap for scientific libraries (OMP/BLAS/MKL)
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_seconds: 30,
            max_processes: 10,
            max_threads: 4,
        }
    }
}

/// Modules the execution subprocess refuses to import.
///
/// pandas and matplotlib must stay importable; the list blocks the obvious
/// escape hatches (process spawning, sockets, native code loading).
pub fn default_blocked_modules() -> HashSet<String> {
    [
        "subprocess",
        "multiprocessing",
        "socket",
        "urllib",
        "requests",
        "http",
        "ctypes",
        "pty",
        "fcntl",
        "resource",
        "shutil",
        "webbrowser",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Application configuration, read from the environment (with `.env` overlay
/// applied by the binary before this is constructed).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    pub listen_addr: String,
    /// CSV file backing the dataset
    pub csv_path: PathBuf,
    /// Where a produced figure is written (overwritten per request)
    pub graphic_path: PathBuf,
    /// Chat model identifier
    pub model: String,
    /// Base URL of the OpenAI-compatible endpoint
    pub api_base_url: String,
    /// API key, if configured; checked per request so the form still renders
    pub api_key: Option<String>,
    /// Completion budget for the model reply
    pub max_tokens: u32,
    /// HTTP timeout toward the chat endpoint
    pub request_timeout: Duration,
    /// Wall-clock deadline for one snippet execution
    pub exec_timeout: Duration,
    /// Subprocess resource limits
    pub limits: ResourceLimits,
    /// Import blacklist installed in the subprocess
    pub blocked_modules: HashSet<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            csv_path: PathBuf::from("data/autoscout24_data.csv"),
            graphic_path: PathBuf::from("static/graphic.png"),
            model: "gpt-4.1-mini".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            max_tokens: 300,
            request_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(35),
            limits: ResourceLimits::default(),
            blocked_modules: default_blocked_modules(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults above for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_nonempty("PROMPTPLOT_LISTEN") {
            cfg.listen_addr = v;
        }
        if let Some(v) = env_nonempty("PROMPTPLOT_CSV") {
            cfg.csv_path = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("PROMPTPLOT_STATIC_DIR") {
            cfg.graphic_path = PathBuf::from(v).join("graphic.png");
        }
        if let Some(v) = env_nonempty("PROMPTPLOT_MODEL") {
            cfg.model = v;
        }
        if let Some(v) = env_nonempty("API_BASE_URL") {
            cfg.api_base_url = normalize_base_url(&v);
        }
        cfg.api_key = env_nonempty("OPENAI_API_KEY");
        if let Some(v) = env_nonempty("PROMPTPLOT_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                cfg.max_tokens = n;
            }
        }
        if let Some(v) = env_nonempty("REQUEST_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                cfg.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(v) = env_nonempty("PROMPTPLOT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.exec_timeout = Duration::from_secs(secs);
                cfg.limits.cpu_seconds = secs.saturating_sub(5).max(5);
            }
        }

        cfg
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Accept both bare hosts and URLs that already carry a `/v1` suffix.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.ends_with("/v1") || trimmed.contains("/v1/") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}
