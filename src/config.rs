use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use clap::ValueEnum;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ======================================================
// CONSTANTS
// ======================================================

pub const DEFAULT_SPECIALTY: &str = "dermatologue";
pub const DEFAULT_CITY: &str = "toulouse";
pub const DEFAULT_WINDOW_DAYS: u32 = 14;
pub const DEFAULT_TIMEZONE: &str = "Europe/Paris";
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DOCTOLIB_ORIGIN: &str = "https://www.doctolib.fr";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const MASK: &str = "********";

// ======================================================
// TYPES
// ======================================================

/// When a run sends its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    /// Every run delivers the current list.
    Always,
    /// Only runs whose results differ from the saved state deliver.
    Changes,
}

impl FromStr for NotifyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(NotifyMode::Always),
            "changes" | "on-change" | "diff" => Ok(NotifyMode::Changes),
            other => Err(Error::config(format!(
                "unknown notify mode '{}' (expected: always | changes)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NotifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyMode::Always  => write!(f, "always"),
            NotifyMode::Changes => write!(f, "changes"),
        }
    }
}

/// How the search page is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    /// Render with a headless Chromium-family browser.
    Chrome,
    /// Plain HTTP GET; only sees server-rendered markup.
    Http,
}

impl FromStr for FetcherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "chrome" | "chromium" | "browser" => Ok(FetcherKind::Chrome),
            "http" => Ok(FetcherKind::Http),
            other => Err(Error::config(format!(
                "unknown fetcher '{}' (expected: chrome | http)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub specialty: String,
    pub city: String,
    /// Full search URL. Overrides specialty/city when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            specialty: DEFAULT_SPECIALTY.to_string(),
            city: DEFAULT_CITY.to_string(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub kind: FetcherKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_bin: Option<PathBuf>,
    /// Virtual time Chrome grants the page for scripts and lazy loading.
    pub virtual_time_budget_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            kind: FetcherKind::Chrome,
            chrome_bin: None,
            virtual_time_budget_ms: 8_000,
            timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            chat_id: None,
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        non_empty(&self.token) && non_empty(&self.chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Sent as X-Doctobot-Secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl WebhookConfig {
    pub fn is_configured(&self) -> bool {
        non_empty(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    /// Set false only for local relays.
    pub starttls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            starttls: true,
            from: None,
            to: Vec::new(),
        }
    }
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        non_empty(&self.smtp_host) && non_empty(&self.from) && !self.to.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub search: SearchConfig,
    pub window_days: u32,
    pub timezone: String,
    pub mode: NotifyMode,
    pub notify_when_empty: bool,
    /// Data directory for state, history and the run lock. Defaults to ~/.doctobot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    pub fetcher: FetcherConfig,
    pub telegram: TelegramConfig,
    pub webhook: WebhookConfig,
    pub email: EmailConfig,
    pub log: LogConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            window_days: DEFAULT_WINDOW_DAYS,
            timezone: DEFAULT_TIMEZONE.to_string(),
            mode: NotifyMode::Always,
            notify_when_empty: false,
            home: None,
            state_path: None,
            fetcher: FetcherConfig::default(),
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            email: EmailConfig::default(),
            log: LogConfig::default(),
        }
    }
}

// ======================================================
// LOADING
// ======================================================

impl Settings {
    /// Resolve settings: defaults, then the YAML file (explicit path or
    /// DOCTOBOT_CONFIG), then environment variables. CLI flags are applied
    /// by the caller on the returned value.
    pub fn load(file: Option<&Path>) -> Result<Settings> {
        let from_env = env::var_os("DOCTOBOT_CONFIG").map(PathBuf::from);

        let mut settings = match file.map(Path::to_path_buf).or(from_env) {
            Some(path) => Settings::from_file(&path)?,
            None => Settings::default(),
        };

        settings.apply_env(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Settings::from_yaml_str(&raw)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Settings> {
        if raw.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(raw).map_err(|e| Error::config(format!("invalid YAML: {}", e)))
    }

    /// Overlay environment variables read through `get`.
    pub fn apply_env<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WINDOW_DAYS") {
            self.window_days = v.trim().parse().map_err(|_| {
                Error::config(format!("WINDOW_DAYS must be a non-negative integer, got '{}'", v))
            })?;
        }
        if let Some(v) = get("NOTIFY_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = get("NOTIFY_WHEN_EMPTY") {
            self.notify_when_empty = parse_bool("NOTIFY_WHEN_EMPTY", &v)?;
        }
        if let Some(v) = get("STATE_PATH") {
            self.state_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DOCTOBOT_HOME") {
            self.home = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DOCTOBOT_URL") {
            self.search.url = Some(v);
        }
        if let Some(v) = get("DOCTOBOT_SPECIALTY") {
            self.search.specialty = v;
        }
        if let Some(v) = get("DOCTOBOT_CITY") {
            self.search.city = v;
        }
        if let Some(v) = get("DOCTOBOT_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = get("DOCTOBOT_FETCHER") {
            self.fetcher.kind = v.parse()?;
        }
        if let Some(v) = get("CHROME_BIN") {
            self.fetcher.chrome_bin = Some(PathBuf::from(v));
        }

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.token = Some(v);
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(v);
        }
        if let Some(v) = get("TELEGRAM_API_URL") {
            self.telegram.api_base = v;
        }

        if let Some(v) = get("DOCTOBOT_WEBHOOK_URL") {
            self.webhook.url = Some(v);
        }
        if let Some(v) = get("DOCTOBOT_WEBHOOK_SECRET") {
            self.webhook.secret = Some(v);
        }

        if let Some(v) = get("SMTP_HOST") {
            self.email.smtp_host = Some(v);
        }
        if let Some(v) = get("SMTP_PORT") {
            self.email.smtp_port = v.trim().parse().map_err(|_| {
                Error::config(format!("SMTP_PORT must be a port number, got '{}'", v))
            })?;
        }
        if let Some(v) = get("SMTP_USERNAME") {
            self.email.smtp_username = Some(v);
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.email.smtp_password = Some(v);
        }
        if let Some(v) = get("MAIL_FROM") {
            self.email.from = Some(v);
        }
        if let Some(v) = get("MAIL_TO") {
            self.email.to = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }

        if let Some(v) = get("DOCTOBOT_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("DOCTOBOT_LOG_JSON") {
            self.log.json = parse_bool("DOCTOBOT_LOG_JSON", &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        self.search_url()?;
        if self.search.url.is_none() {
            for (field, value) in [("specialty", &self.search.specialty), ("city", &self.search.city)] {
                if value.trim().is_empty() || value.contains('/') {
                    return Err(Error::config(format!("search {} '{}' is not a valid path segment", field, value)));
                }
            }
        }
        if self.fetcher.timeout_secs == 0 {
            return Err(Error::config("fetcher.timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

// ======================================================
// DERIVED VALUES
// ======================================================

impl Settings {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| Error::config(format!("unknown time zone '{}': {}", self.timezone, e)))
    }

    pub fn search_url(&self) -> Result<Url> {
        let raw = match &self.search.url {
            Some(url) => url.clone(),
            None => format!(
                "{}/{}/{}?availabilities=1",
                DOCTOLIB_ORIGIN,
                self.search.specialty.trim(),
                self.search.city.trim()
            ),
        };
        Url::parse(&raw).map_err(|e| Error::config(format!("invalid search URL '{}': {}", raw, e)))
    }

    /// Specialty slug. An explicit search URL wins: its first path segment.
    pub fn specialty(&self) -> String {
        self.url_segment(0)
            .unwrap_or_else(|| self.search.specialty.trim().to_string())
    }

    /// City slug. An explicit search URL wins: its second path segment.
    pub fn city(&self) -> String {
        self.url_segment(1)
            .unwrap_or_else(|| self.search.city.trim().to_string())
    }

    fn url_segment(&self, index: usize) -> Option<String> {
        self.search.url.as_ref()?;
        let url = self.search_url().ok()?;
        let segment = url.path_segments()?.filter(|s| !s.is_empty()).nth(index)?;
        Some(segment.to_string())
    }

    /// Path fragment practitioner links contain, e.g. `/dermatologue/`.
    pub fn link_fragment(&self) -> String {
        format!("/{}/", self.specialty())
    }

    pub fn home_dir(&self) -> Result<PathBuf> {
        if let Some(home) = &self.home {
            return Ok(home.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::config("could not determine home directory; set DOCTOBOT_HOME"))?;
        Ok(home.join(".doctobot"))
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(p) => Ok(p.clone()),
            None => Ok(self.home_dir()?.join("state.json")),
        }
    }

    pub fn history_dir(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("history"))
    }

    pub fn lock_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("run.lock"))
    }

    /// Copy with every credential replaced, for display.
    pub fn masked(&self) -> Settings {
        let mut s = self.clone();
        if s.telegram.token.is_some() {
            s.telegram.token = Some(MASK.to_string());
        }
        if s.webhook.secret.is_some() {
            s.webhook.secret = Some(MASK.to_string());
        }
        if s.email.smtp_password.is_some() {
            s.email.smtp_password = Some(MASK.to_string());
        }
        s
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::config(format!("failed to render config: {}", e)))
    }
}

// ======================================================
// HELPERS
// ======================================================

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{} must be a boolean, got '{}'", key, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_target_toulouse_dermatologists() {
        let settings = Settings::default();
        assert_eq!(settings.window_days, 14);
        assert_eq!(settings.mode, NotifyMode::Always);
        assert_eq!(
            settings.search_url().unwrap().as_str(),
            "https://www.doctolib.fr/dermatologue/toulouse?availabilities=1"
        );
        assert_eq!(settings.link_fragment(), "/dermatologue/");
        assert_eq!(settings.tz().unwrap(), chrono_tz::Europe::Paris);
    }

    #[test]
    fn env_overrides_defaults() {
        let mut settings = Settings::default();
        settings
            .apply_env(env_of(&[
                ("WINDOW_DAYS", "7"),
                ("NOTIFY_MODE", "changes"),
                ("NOTIFY_WHEN_EMPTY", "1"),
                ("STATE_PATH", "/data/state.json"),
                ("TELEGRAM_BOT_TOKEN", "123:abc"),
                ("TELEGRAM_CHAT_ID", "42"),
                ("MAIL_TO", "a@example.com, b@example.com,"),
                ("DOCTOBOT_FETCHER", "http"),
            ]))
            .unwrap();

        assert_eq!(settings.window_days, 7);
        assert_eq!(settings.mode, NotifyMode::Changes);
        assert!(settings.notify_when_empty);
        assert_eq!(settings.state_path().unwrap(), PathBuf::from("/data/state.json"));
        assert!(settings.telegram.is_configured());
        assert_eq!(settings.email.to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(settings.fetcher.kind, FetcherKind::Http);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut settings = Settings::default();
        settings
            .apply_env(env_of(&[("WINDOW_DAYS", ""), ("TELEGRAM_BOT_TOKEN", "  ")]))
            .unwrap();
        assert_eq!(settings.window_days, 14);
        assert!(settings.telegram.token.is_none());
    }

    #[test]
    fn malformed_window_is_a_config_error() {
        let mut settings = Settings::default();
        let err = settings.apply_env(env_of(&[("WINDOW_DAYS", "two weeks")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("WINDOW_DAYS"));
    }

    #[test]
    fn malformed_boolean_is_a_config_error() {
        let mut settings = Settings::default();
        assert!(settings.apply_env(env_of(&[("NOTIFY_WHEN_EMPTY", "maybe")])).is_err());
    }

    #[test]
    fn yaml_file_layers_under_env() {
        let yaml = r#"
search:
  specialty: ophtalmologue
  city: lyon
window_days: 30
mode: changes
telegram:
  chat_id: "99"
"#;
        let mut settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.window_days, 30);
        assert_eq!(settings.mode, NotifyMode::Changes);
        assert_eq!(settings.telegram.api_base, TELEGRAM_API_BASE);
        assert_eq!(
            settings.search_url().unwrap().as_str(),
            "https://www.doctolib.fr/ophtalmologue/lyon?availabilities=1"
        );

        settings.apply_env(env_of(&[("WINDOW_DAYS", "3")])).unwrap();
        assert_eq!(settings.window_days, 3);
        assert_eq!(settings.telegram.chat_id.as_deref(), Some("99"));
    }

    #[test]
    fn explicit_url_wins_over_specialty_and_city() {
        let mut settings = Settings::default();
        settings.search.url = Some("https://www.doctolib.fr/dermatologue/paris".into());
        assert_eq!(settings.search_url().unwrap().path(), "/dermatologue/paris");
    }

    #[test]
    fn explicit_url_drives_specialty_city_and_fragment() {
        let mut settings = Settings::default();
        settings.search.url = Some("https://www.doctolib.fr/dentiste/lyon?availabilities=1".into());
        assert_eq!(settings.specialty(), "dentiste");
        assert_eq!(settings.city(), "lyon");
        assert_eq!(settings.link_fragment(), "/dentiste/");

        // A URL without a city segment keeps the configured city.
        settings.search.url = Some("https://www.doctolib.fr/dentiste".into());
        assert_eq!(settings.specialty(), "dentiste");
        assert_eq!(settings.city(), DEFAULT_CITY);
    }

    #[test]
    fn validate_rejects_unknown_timezone() {
        let settings = Settings {
            timezone: "Mars/Olympus_Mons".into(),
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_path_in_city() {
        let mut settings = Settings::default();
        settings.search.city = "toulouse/extra".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn paths_live_under_home() {
        let settings = Settings {
            home: Some(PathBuf::from("/srv/doctobot")),
            ..Settings::default()
        };
        assert_eq!(settings.state_path().unwrap(), PathBuf::from("/srv/doctobot/state.json"));
        assert_eq!(settings.history_dir().unwrap(), PathBuf::from("/srv/doctobot/history"));
        assert_eq!(settings.lock_path().unwrap(), PathBuf::from("/srv/doctobot/run.lock"));
    }

    #[test]
    fn masked_hides_credentials() {
        let mut settings = Settings::default();
        settings.telegram.token = Some("123:secret".into());
        settings.email.smtp_password = Some("hunter2".into());
        let yaml = settings.masked().to_yaml().unwrap();
        assert!(!yaml.contains("123:secret"));
        assert!(!yaml.contains("hunter2"));
        assert!(yaml.contains(MASK));
    }
}
