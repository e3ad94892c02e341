use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::leagues::League;

const APP_DIR: &str = "matchday_hub";
const DB_FILE: &str = "matchday.sqlite";
const DISK_CACHE_DIR: &str = "cache";

pub const FOOTBALL_DATA_BASE_URL: &str = "https://api.football-data.org/v4";
pub const API_FOOTBALL_BASE_URL: &str = "https://v3.football.api-sports.io";
pub const FOTMOB_BASE_URL: &str = "https://www.fotmob.com/api";

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub http: HttpConfig,
    pub providers: ProvidersConfig,
    pub aggregator: AggregatorConfig,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub memory_ttl: Duration,
    pub disk_ttl: Duration,
    pub stale_max_age: Duration,
    pub memory_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub db_path: PathBuf,
    pub max_connections: usize,
    pub acquire_attempts: u32,
    pub acquire_base_delay: Duration,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Parses `N/T` where `T` is seconds, e.g. `10/60`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (count, secs) = raw.trim().split_once('/')?;
        let count = count.trim().parse::<usize>().ok()?;
        let secs = secs.trim().parse::<f64>().ok()?;
        if count == 0 || !secs.is_finite() || secs <= 0.0 {
            return None;
        }
        Some(Self::new(count, Duration::from_secs_f64(secs)))
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_connections: usize,
    pub user_agent: String,
    pub default_rate_limit: RateLimit,
    pub rate_limits: HashMap<String, RateLimit>,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub football_data: ProviderConfig,
    pub api_football: ProviderConfig,
    pub fotmob: ProviderConfig,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub fetch_parallelism: usize,
    pub query_timeout: Duration,
    pub default_leagues: Vec<League>,
    pub season: u16,
}

impl HubConfig {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let num = |key: &str, default: u64, min: u64, max: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
                .clamp(min, max)
        };
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| {
                    let t = v.to_ascii_lowercase();
                    !(t == "0" || t == "false" || t == "off" || t == "no")
                })
                .unwrap_or(default)
        };

        let base_dir = get("HUB_DATA_DIR")
            .map(PathBuf::from)
            .or_else(app_cache_dir)
            .unwrap_or_else(|| env::temp_dir().join(APP_DIR));

        let cache = CacheConfig {
            dir: get("HUB_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join(DISK_CACHE_DIR)),
            memory_ttl: Duration::from_secs(num("HUB_MEMORY_TTL_SECS", 300, 1, 86_400)),
            disk_ttl: Duration::from_secs(num("HUB_DISK_TTL_SECS", 3_600, 1, 30 * 86_400)),
            stale_max_age: Duration::from_secs(num(
                "HUB_STALE_MAX_AGE_SECS",
                7 * 86_400,
                60,
                365 * 86_400,
            )),
            memory_capacity: num("HUB_MEMORY_CAPACITY", 512, 1, 1_000_000) as usize,
        };

        let pool = PoolConfig {
            db_path: get("HUB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join(DB_FILE)),
            max_connections: num("HUB_DB_MAX_CONNECTIONS", 5, 1, 64) as usize,
            acquire_attempts: num("HUB_DB_ACQUIRE_ATTEMPTS", 10, 1, 100) as u32,
            acquire_base_delay: Duration::from_millis(num("HUB_DB_ACQUIRE_DELAY_MS", 50, 1, 5_000)),
            busy_timeout: Duration::from_millis(num("HUB_DB_BUSY_TIMEOUT_MS", 5_000, 0, 60_000)),
        };

        let default_rate_limit = get("HUB_RATE_LIMIT_DEFAULT")
            .and_then(|v| RateLimit::parse(&v))
            .unwrap_or(RateLimit::new(30, Duration::from_secs(60)));
        let rate_limits = get("HUB_RATE_LIMITS")
            .map(|raw| parse_rate_limits(&raw))
            .unwrap_or_else(default_rate_limits);

        let http = HttpConfig {
            timeout: Duration::from_secs(num("HUB_HTTP_TIMEOUT_SECS", 10, 1, 120)),
            max_retries: num("HUB_HTTP_MAX_RETRIES", 3, 0, 10) as u32,
            base_delay: Duration::from_millis(num("HUB_HTTP_BASE_DELAY_MS", 500, 1, 30_000)),
            max_connections: num("HUB_HTTP_MAX_CONNECTIONS", 6, 1, 32) as usize,
            user_agent: get("HUB_USER_AGENT").unwrap_or_else(|| "Mozilla/5.0".to_string()),
            default_rate_limit,
            rate_limits,
        };

        let provider = |prefix: &str, default_url: &str, needs_key: bool| {
            let api_key = get(&format!("{prefix}_API_KEY"));
            let enabled = flag(&format!("{prefix}_ENABLED"), true) && (!needs_key || api_key.is_some());
            ProviderConfig {
                enabled,
                base_url: get(&format!("{prefix}_BASE_URL"))
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| default_url.to_string()),
                api_key,
            }
        };
        let providers = ProvidersConfig {
            football_data: provider("FOOTBALL_DATA", FOOTBALL_DATA_BASE_URL, true),
            api_football: provider("API_FOOTBALL", API_FOOTBALL_BASE_URL, true),
            fotmob: provider("FOTMOB", FOTMOB_BASE_URL, false),
        };

        let default_leagues = get("HUB_DEFAULT_LEAGUES")
            .map(|raw| {
                raw.split([',', ';', ' '])
                    .filter_map(League::from_code)
                    .collect::<Vec<_>>()
            })
            .filter(|leagues| !leagues.is_empty())
            .unwrap_or_else(|| vec![League::LaLiga, League::PremierLeague]);

        let aggregator = AggregatorConfig {
            fetch_parallelism: num("FETCH_PARALLELISM", 6, 2, 32) as usize,
            query_timeout: Duration::from_secs(num("HUB_QUERY_TIMEOUT_SECS", 20, 1, 300)),
            default_leagues,
            season: get("HUB_SEASON")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or_else(current_season),
        };

        Self {
            cache,
            pool,
            http,
            providers,
            aggregator,
        }
    }
}

/// `host=N/T` pairs separated by commas.
pub fn parse_rate_limits(raw: &str) -> HashMap<String, RateLimit> {
    raw.split(',')
        .filter_map(|pair| {
            let (host, limit) = pair.split_once('=')?;
            let host = host.trim().to_ascii_lowercase();
            if host.is_empty() {
                return None;
            }
            Some((host, RateLimit::parse(limit)?))
        })
        .collect()
}

fn default_rate_limits() -> HashMap<String, RateLimit> {
    // Free tiers: football-data 10/min, api-sports 10/min.
    let mut limits = HashMap::new();
    limits.insert(
        "api.football-data.org".to_string(),
        RateLimit::new(10, Duration::from_secs(60)),
    );
    limits.insert(
        "v3.football.api-sports.io".to_string(),
        RateLimit::new(10, Duration::from_secs(60)),
    );
    limits.insert(
        "www.fotmob.com".to_string(),
        RateLimit::new(60, Duration::from_secs(60)),
    );
    limits
}

fn current_season() -> u16 {
    use chrono::Datelike;
    let today = chrono::Utc::now().date_naive();
    // European seasons roll over in July.
    let year = if today.month() >= 7 {
        today.year()
    } else {
        today.year() - 1
    };
    u16::try_from(year).unwrap_or(2025)
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME") {
        if !base.trim().is_empty() {
            return Some(PathBuf::from(base).join(APP_DIR));
        }
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}
