mod wordlists;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::bruteforcer::ScanDirection;
use crate::processing::ProcessingRule;
use crate::transform::BypassMode;

pub use wordlists::{default_user_agents, load_lines, WordlistError, Wordlists};

pub const DEFAULT_EXCLUDE_SUFFIX: &str = "3g2|3gp|7z|aac|avi|bmp|css|eot|flv|gif|gz|ico|jpeg|jpg|js|m4a|mkv|mov|mp3|mp4|ogg|otf|pdf|png|svg|swf|tar|tif|ttf|wav|webm|webp|woff|woff2|zip";

/// Fully resolved settings read by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub scan_level: usize,
    pub scan_direction: ScanDirection,
    /// `|`-delimited, empty allows every method
    pub include_method: String,
    /// `|`-delimited extensions, case-insensitive
    pub exclude_suffix: String,
    pub retry_count: u32,
    pub retry_interval_ms: u64,
    /// 0 disables; values above 9999 disable too
    pub qps_limit: u32,
    pub request_delay_ms: u64,
    pub follow_redirect: bool,
    pub redirect_cookies_follow: bool,
    pub redirect_target_host_limit: bool,
    pub intercept_timeout_host: bool,
    pub dir_scan: bool,
    pub bypass_mode: BypassMode,
    pub replace_header: bool,
    pub remove_header: bool,
    pub payload_processing: bool,
    pub processing_rules: Vec<ProcessingRule>,
    pub task_threads: usize,
    pub lf_task_threads: usize,
    pub fp_threads: usize,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    pub payload_set: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scan_level: 99,
            scan_direction: ScanDirection::Left,
            include_method: String::new(),
            exclude_suffix: DEFAULT_EXCLUDE_SUFFIX.to_string(),
            retry_count: 0,
            retry_interval_ms: 500,
            qps_limit: 0,
            request_delay_ms: 0,
            follow_redirect: true,
            redirect_cookies_follow: false,
            redirect_target_host_limit: true,
            intercept_timeout_host: false,
            dir_scan: true,
            bypass_mode: BypassMode::None,
            replace_header: true,
            remove_header: true,
            payload_processing: false,
            processing_rules: Vec::new(),
            task_threads: 50,
            lf_task_threads: 25,
            fp_threads: 10,
            timeout_secs: 10,
            proxy: None,
            payload_set: "default".to_string(),
        }
    }
}

impl ScanSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Applies every value present in the config file.
    pub fn merge_file(&mut self, cfg: &ConfigFile) {
        if let Some(v) = cfg.scan_level {
            self.scan_level = v;
        }
        if let Some(v) = cfg.scan_direction {
            self.scan_direction = v;
        }
        if let Some(v) = cfg.include_method.as_ref() {
            self.include_method = v.clone();
        }
        if let Some(v) = cfg.exclude_suffix.as_ref() {
            self.exclude_suffix = v.clone();
        }
        if let Some(v) = cfg.retry_count {
            self.retry_count = v;
        }
        if let Some(v) = cfg.retry_interval_ms {
            self.retry_interval_ms = v;
        }
        if let Some(v) = cfg.qps_limit {
            self.qps_limit = v;
        }
        if let Some(v) = cfg.request_delay_ms {
            self.request_delay_ms = v;
        }
        if let Some(v) = cfg.follow_redirect {
            self.follow_redirect = v;
        }
        if let Some(v) = cfg.redirect_cookies_follow {
            self.redirect_cookies_follow = v;
        }
        if let Some(v) = cfg.redirect_target_host_limit {
            self.redirect_target_host_limit = v;
        }
        if let Some(v) = cfg.intercept_timeout_host {
            self.intercept_timeout_host = v;
        }
        if let Some(v) = cfg.dir_scan {
            self.dir_scan = v;
        }
        if let Some(v) = cfg.bypass_mode {
            self.bypass_mode = v;
        }
        if let Some(v) = cfg.replace_header {
            self.replace_header = v;
        }
        if let Some(v) = cfg.remove_header {
            self.remove_header = v;
        }
        if let Some(v) = cfg.payload_processing {
            self.payload_processing = v;
        }
        if let Some(v) = cfg.processing_rules.as_ref() {
            self.processing_rules = v.clone();
        }
        if let Some(v) = cfg.task_threads {
            self.task_threads = v;
        }
        if let Some(v) = cfg.lf_task_threads {
            self.lf_task_threads = v;
        }
        if let Some(v) = cfg.fp_threads {
            self.fp_threads = v;
        }
        if let Some(v) = cfg.timeout {
            self.timeout_secs = v;
        }
        if let Some(v) = cfg.proxy.as_ref() {
            self.proxy = Some(v.clone());
        }
        if let Some(v) = cfg.payload_set.as_ref() {
            self.payload_set = v.clone();
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct ConfigFile {
    pub urls: Option<Vec<String>>,
    pub input_file: Option<String>,
    pub wordlists: Option<String>,
    pub output: Option<String>,
    pub output_format: Option<String>,
    pub collect_output: Option<String>,
    pub no_color: Option<bool>,
    pub scan_level: Option<usize>,
    pub scan_direction: Option<ScanDirection>,
    pub include_method: Option<String>,
    pub exclude_suffix: Option<String>,
    pub retry_count: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    #[serde(alias = "rate")]
    pub qps_limit: Option<u32>,
    pub request_delay_ms: Option<u64>,
    #[serde(alias = "follow_redirects")]
    pub follow_redirect: Option<bool>,
    pub redirect_cookies_follow: Option<bool>,
    pub redirect_target_host_limit: Option<bool>,
    pub intercept_timeout_host: Option<bool>,
    pub dir_scan: Option<bool>,
    pub bypass_mode: Option<BypassMode>,
    pub replace_header: Option<bool>,
    pub remove_header: Option<bool>,
    pub payload_processing: Option<bool>,
    pub processing_rules: Option<Vec<ProcessingRule>>,
    pub task_threads: Option<usize>,
    pub lf_task_threads: Option<usize>,
    pub fp_threads: Option<usize>,
    pub timeout: Option<u64>,
    pub proxy: Option<String>,
    pub payload_set: Option<String>,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .or_else(|| {
            let drive = env::var_os("HOMEDRIVE")?;
            let path = env::var_os("HOMEPATH")?;
            Some(PathBuf::from(drive).join(path))
        })
}

pub fn default_config_path() -> Option<PathBuf> {
    Some(home_dir()?.join(".pathforge").join("config.yml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn expand_tilde_string(path: &str) -> String {
    expand_tilde(path).to_string_lossy().to_string()
}

pub fn load_config(path: &PathBuf, allow_missing: bool) -> Result<ConfigFile, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str::<ConfigFile>(&contents)
            .map_err(|e| format!("failed to parse config '{}': {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && allow_missing => {
            Ok(ConfigFile::default())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("config file not found '{}'", path.display()))
        }
        Err(e) => Err(format!("failed to read config '{}': {e}", path.display())),
    }
}

fn default_config_yaml() -> String {
    format!(
        r#"# pathforge config
#
# Location (default):
#   ~/.pathforge/config.yml

# Targets (optional, CLI flags add to these)
# urls:
#   - https://example.com/app/
# input_file: ./targets.txt

# Wordlist directory: payloads/<set>.txt, bypass_prefix.txt, bypass_suffix.txt,
# headers.txt, remove_headers.txt, host_allow.txt, host_deny.txt, user_agents.txt
# wordlists: ~/.pathforge/wordlists
payload_set: default

# Output (optional)
# output: ./results.json
# output_format: json
# collect_output: ./collected.json
no_color: false

# Directory scan
dir_scan: true
scan_level: 99
scan_direction: left
bypass_mode: none

# Filters
include_method: ""
exclude_suffix: "{DEFAULT_EXCLUDE_SUFFIX}"

# Requests
timeout: 10
retry_count: 0
retry_interval_ms: 500
qps_limit: 0
request_delay_ms: 0
intercept_timeout_host: false
replace_header: true
remove_header: true
# proxy: http://127.0.0.1:8080

# Redirects
follow_redirect: true
redirect_cookies_follow: false
redirect_target_host_limit: true

# Worker pools
task_threads: 50
lf_task_threads: 25
fp_threads: 10

# Payload processing
payload_processing: false
processing_rules: []
# processing_rules:
#   - name: api-prefix
#     merge: true
#     scope: url
#     transforms:
#       - kind: add_prefix
#         value: /api
"#
    )
}

pub fn ensure_default_config_file(path: &PathBuf) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }
    let parent = path
        .parent()
        .ok_or_else(|| format!("invalid config path '{}'", path.display()))?;
    std::fs::create_dir_all(parent).map_err(|e| {
        format!(
            "failed to create config directory '{}': {e}",
            parent.display()
        )
    })?;
    let contents = default_config_yaml();
    std::fs::write(path, contents)
        .map_err(|e| format!("failed to write config file '{}': {e}", path.display()))?;
    Ok(())
}
