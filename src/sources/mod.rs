//! Provider adapters. Each one owns its provider's wire format and maps it
//! onto the canonical entities; all network access goes through the shared
//! `RateLimitedClient`.

pub mod api_football;
pub mod football_data;
pub mod fotmob;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::ProvidersConfig;
use crate::entity::{Match, Player, Standing, Team};
use crate::error::{HubError, Result};
use crate::http_client::{HttpRequest, RateLimitedClient};
use crate::leagues::League;

pub use api_football::ApiFootballSource;
pub use football_data::FootballDataSource;
pub use fotmob::FotmobSource;

/// Widest match window, in days after `from`. Per-day providers send one
/// request for every day in it.
pub const MAX_MATCH_WINDOW_DAYS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamQuery {
    pub league: League,
    pub season: u16,
}

/// A team as every provider may know it: a display name plus provider ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeamRef {
    pub name: String,
    pub external_ids: BTreeMap<String, String>,
}

impl TeamRef {
    pub fn from_team(team: &Team) -> Self {
        Self {
            name: team.name.clone(),
            external_ids: team.external_ids.clone(),
        }
    }

    /// This provider's native id, with the adapter's `prefix:` removed.
    pub fn native_id(&self, source_id: &str, prefix: &str) -> Option<String> {
        self.external_ids
            .get(source_id)
            .map(|id| id.strip_prefix(prefix).unwrap_or(id).to_string())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerQuery {
    pub team: TeamRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchQuery {
    pub league: Option<League>,
    pub season: u16,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl MatchQuery {
    pub fn contains(&self, kickoff: &DateTime<Utc>) -> bool {
        let day = kickoff.date_naive();
        day >= self.from && day <= self.to
    }

    /// Each calendar day in `from..=to`, at most `MAX_MATCH_WINDOW_DAYS` past `from`.
    pub fn days(&self) -> Vec<NaiveDate> {
        let span = (self.to - self.from).num_days().max(0);
        let max = i64::from(MAX_MATCH_WINDOW_DAYS);
        if span > max {
            warn!(from = %self.from, to = %self.to, max, "match window too wide, capping");
        }
        (0..=span.min(max))
            .map(|offset| self.from + ChronoDuration::days(offset))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandingsQuery {
    pub league: League,
    pub season: u16,
}

/// One external provider. "No data" is an empty list; `SourceUnavailable`
/// is reserved for transport and auth failures.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn fetch_teams(&self, query: &TeamQuery, cancel: &CancelToken) -> Result<Vec<Team>>;

    fn fetch_players(&self, query: &PlayerQuery, cancel: &CancelToken) -> Result<Vec<Player>>;

    fn fetch_matches(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>>;

    fn fetch_standings(&self, query: &StandingsQuery, cancel: &CancelToken)
    -> Result<Vec<Standing>>;
}

/// Builds every adapter enabled in `config`, in priority order.
pub fn enabled_sources(
    config: &ProvidersConfig,
    client: Arc<RateLimitedClient>,
) -> Vec<Arc<dyn SourceAdapter>> {
    let mut sources: Vec<Arc<dyn SourceAdapter>> = Vec::new();
    if config.football_data.enabled {
        sources.push(Arc::new(FootballDataSource::new(
            &config.football_data,
            client.clone(),
        )));
    }
    if config.api_football.enabled {
        sources.push(Arc::new(ApiFootballSource::new(
            &config.api_football,
            client.clone(),
        )));
    }
    if config.fotmob.enabled {
        sources.push(Arc::new(FotmobSource::new(&config.fotmob, client)));
    }
    sources
}

/// Runs `request` and returns the body, `None` for "no data" statuses.
pub(crate) fn fetch_body(
    client: &RateLimitedClient,
    source_id: &str,
    request: &HttpRequest,
    cancel: &CancelToken,
) -> Result<Option<String>> {
    let resp = client
        .request(request, cancel)
        .map_err(|err| err.into_source_unavailable(source_id))?;
    classify_body(source_id, &request.url, resp.status, resp.body)
}

pub(crate) fn classify_body(
    source_id: &str,
    url: &str,
    status: u16,
    body: String,
) -> Result<Option<String>> {
    match status {
        204 | 404 => {
            debug!(source = source_id, url = %url, status, "no data");
            Ok(None)
        }
        401 | 403 => Err(HubError::source_unavailable(
            source_id,
            format!("unauthorized (http {status})"),
        )),
        s if (200..300).contains(&s) => {
            let trimmed = body.trim();
            if trimmed.is_empty() || trimmed == "null" {
                Ok(None)
            } else {
                Ok(Some(body))
            }
        }
        s => Err(HubError::source_unavailable(source_id, format!("http {s}"))),
    }
}

pub(crate) fn malformed(source_id: &str, what: &str, err: impl std::fmt::Display) -> HubError {
    HubError::source_unavailable(source_id, format!("malformed {what} payload: {err}"))
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM[:SS]` (UTC assumed) and bare dates.
pub(crate) fn parse_kickoff(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    let cleaned = trimmed.trim_end_matches('Z').replace(' ', "T");
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(&cleaned, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
