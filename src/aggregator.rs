//! Query orchestration: cache lookup, concurrent fan-out to every enabled
//! source, merge with manual records, write-through.
//!
//! Each aggregation moves through MISS -> FETCHING -> MERGING -> CACHED. When
//! no source succeeds the call falls back to a stale cached copy, then to
//! manual records, and only then fails with `AllSourcesFailed`.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheParams, CacheStats, TieredCache};
use crate::cancel::CancelToken;
use crate::config::{AggregatorConfig, HubConfig};
use crate::entity::{Canonical, MANUAL_SOURCE, Match, Player, Standing, Team};
use crate::error::{HubError, Result};
use crate::http_client::RateLimitedClient;
use crate::leagues::League;
use crate::merge::{merge_records, normalize_person_name, normalize_team_name};
use crate::pool::{ConnectionPool, PoolStats};
use crate::sources::{
    MAX_MATCH_WINDOW_DAYS, MatchQuery, PlayerQuery, SourceAdapter, StandingsQuery, TeamQuery,
    TeamRef, enabled_sources,
};
use crate::store::{ExploreResult, MatchInput, PlayerInput, Store, TeamInput, manual_id};

pub const TEAM_NS: &str = "team";
pub const TEAMS_NS: &str = "teams";
pub const PLAYERS_NS: &str = "players";
pub const UPCOMING_NS: &str = "upcoming";
pub const STANDINGS_NS: &str = "standings";
pub const REFEREES_NS: &str = "referees";

const REFEREE_LOOKBACK_DAYS: i64 = 90;

/// How an aggregated value was obtained. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Served from the cache within its TTL.
    Fresh,
    /// Fetched and merged during this call.
    Fetched,
    /// The deadline cut some sources off, or only manual records were available.
    Partial,
    /// Every source failed; this is an expired cached copy.
    Stale,
}

impl Freshness {
    pub fn worst(self, other: Freshness) -> Freshness {
        self.max(other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregated<T> {
    pub value: T,
    pub freshness: Freshness,
    /// `source: reason` for every source that did not contribute.
    pub failed_sources: Vec<String>,
}

impl<T> Aggregated<T> {
    fn new(value: T, freshness: Freshness) -> Self {
        Self {
            value,
            freshness,
            failed_sources: Vec::new(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Aggregated<U> {
        Aggregated {
            value: f(self.value),
            freshness: self.freshness,
            failed_sources: self.failed_sources,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub cache: CacheStats,
    pub pool: PoolStats,
}

struct FanOut<T> {
    /// Successful batches in source order.
    batches: Vec<Vec<T>>,
    failures: Vec<String>,
    timed_out: usize,
}

/// The one surface the application layer talks to. Cheap to clone.
#[derive(Clone)]
pub struct Aggregator {
    sources: Vec<Arc<dyn SourceAdapter>>,
    cache: Arc<TieredCache>,
    store: Store,
    workers: Option<Arc<rayon::ThreadPool>>,
    query_timeout: Duration,
    default_leagues: Vec<League>,
    season: u16,
}

impl Aggregator {
    pub fn new(
        config: &AggregatorConfig,
        sources: Vec<Arc<dyn SourceAdapter>>,
        cache: Arc<TieredCache>,
        store: Store,
    ) -> Self {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fetch_parallelism.max(1))
            .thread_name(|i| format!("fetch-worker-{i}"))
            .build()
            .ok()
            .map(Arc::new);
        Self {
            sources,
            cache,
            store,
            workers,
            query_timeout: config.query_timeout,
            default_leagues: config.default_leagues.clone(),
            season: config.season,
        }
    }

    /// Wires every component from configuration.
    pub fn from_config(config: &HubConfig) -> Result<Self> {
        let client = Arc::new(RateLimitedClient::new(&config.http)?);
        let sources = enabled_sources(&config.providers, client);
        let cache = Arc::new(TieredCache::new(&config.cache));
        let pool = Arc::new(ConnectionPool::new(&config.pool)?);
        let store = Store::open(pool)?;
        info!(
            sources = sources.len(),
            cache_dir = %config.cache.dir.display(),
            db = %config.pool.db_path.display(),
            "aggregator ready"
        );
        Ok(Self::new(&config.aggregator, sources, cache, store))
    }

    /// A copy of this aggregator whose calls give up after `deadline`. The
    /// deadline covers a whole public call, however many fan-outs it runs.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        let mut copy = self.clone();
        copy.query_timeout = deadline;
        copy
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            cache: self.cache.stats(),
            pool: self.store.pool().stats(),
        }
    }

    pub fn close(&self) {
        self.store.pool().close_all();
    }

    pub fn get_teams(&self, league: League) -> Result<Aggregated<Vec<Team>>> {
        self.teams_until(league, self.deadline())
    }

    fn teams_until(&self, league: League, deadline: Instant) -> Result<Aggregated<Vec<Team>>> {
        let query = TeamQuery {
            league,
            season: self.season,
        };
        let params = CacheParams::new()
            .with("league", league.code())
            .with("season", self.season);
        self.aggregate(
            &format!("teams of {}", league.code()),
            TEAMS_NS,
            &params,
            deadline,
            || self.store.teams(Some(league.code())),
            move |source, cancel| source.fetch_teams(&query, cancel),
        )
    }

    /// Looks a team up by store id, provider id or name across the default
    /// leagues and any league a matching manual team belongs to.
    pub fn get_team(&self, name_or_id: &str) -> Result<Aggregated<Team>> {
        self.team_until(name_or_id, self.deadline())
    }

    fn team_until(&self, name_or_id: &str, deadline: Instant) -> Result<Aggregated<Team>> {
        let needle = name_or_id.trim();
        if needle.is_empty() {
            return Err(HubError::validation("team", "required"));
        }
        let params = CacheParams::new().with("ref", needle.to_lowercase());
        if let Some(team) = self.cache.get::<Team>(TEAM_NS, &params) {
            return Ok(Aggregated::new(team, Freshness::Fresh));
        }

        let manual = self.store.find_teams(needle)?;
        let mut leagues: Vec<League> = manual
            .iter()
            .filter_map(|t| t.league.as_deref().and_then(League::from_code))
            .collect();
        for league in &self.default_leagues {
            if !leagues.contains(league) {
                leagues.push(*league);
            }
        }

        let mut freshness = Freshness::Fresh;
        let mut failed_sources = Vec::new();
        let mut last_error = None;
        let mut cut_short = false;
        for league in leagues {
            if Instant::now() >= deadline {
                warn!(league = league.code(), "deadline reached before team search finished");
                failed_sources.push(format!("teams of {}: deadline exceeded", league.code()));
                freshness = freshness.worst(Freshness::Partial);
                cut_short = true;
                continue;
            }
            let listing = match self.teams_until(league, deadline) {
                Ok(listing) => listing,
                Err(err @ HubError::AllSourcesFailed { .. }) => {
                    warn!(league = league.code(), error = %err, "team listing unavailable");
                    freshness = freshness.worst(Freshness::Partial);
                    last_error = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            freshness = freshness.worst(listing.freshness);
            failed_sources.extend(listing.failed_sources);
            if let Some(team) = listing.value.into_iter().find(|t| t.matches_ref(needle)) {
                if freshness <= Freshness::Fetched
                    && let Err(err) = self.cache.set(TEAM_NS, &params, &team)
                {
                    warn!(error = %err, "failed to cache team");
                }
                return Ok(Aggregated {
                    value: team,
                    freshness,
                    failed_sources,
                });
            }
        }

        // Manual teams outside every listed league are still answers.
        if let Some(team) = manual.into_iter().next() {
            let floor = if last_error.is_some() {
                Freshness::Partial
            } else {
                Freshness::Fetched
            };
            return Ok(Aggregated {
                value: team,
                freshness: freshness.worst(floor),
                failed_sources,
            });
        }
        match last_error {
            Some(err) => Err(err),
            None if cut_short => Err(HubError::AllSourcesFailed {
                query: format!("team {needle}"),
                failures: failed_sources,
            }),
            None => Err(HubError::not_found("team", needle)),
        }
    }

    /// Squad of a team; `team_id` is anything `get_team` accepts.
    pub fn get_players_of_team(&self, team_id: &str) -> Result<Aggregated<Vec<Player>>> {
        let deadline = self.deadline();
        let team = self.team_until(team_id, deadline)?;
        let team_freshness = team.freshness;
        let team = team.value;
        let params = CacheParams::new().with("team", normalize_team_name(&team.name));
        let manual_team = team.external_ids.get(MANUAL_SOURCE).and_then(|id| manual_id(id));
        let query = PlayerQuery {
            team: TeamRef::from_team(&team),
        };
        // Providers spell the club differently; players are scoped by team.
        let squad_of = {
            let name = team.name.clone();
            move |mut players: Vec<Player>| {
                for player in &mut players {
                    player.team_name = Some(name.clone());
                }
                players
            }
        };
        let manual_squad = squad_of.clone();

        let mut players = self.aggregate(
            &format!("players of {}", team.name),
            PLAYERS_NS,
            &params,
            deadline,
            || match manual_team {
                Some(id) => self.store.players_of_team(id).map(manual_squad),
                None => Ok(Vec::new()),
            },
            move |source, cancel| source.fetch_players(&query, cancel).map(&squad_of),
        )?;
        if team_freshness == Freshness::Stale {
            players.freshness = players.freshness.worst(Freshness::Partial);
        }
        Ok(players)
    }

    /// Matches kicking off from today through `days` days ahead.
    pub fn get_upcoming_matches(
        &self,
        days: u32,
        league: Option<League>,
    ) -> Result<Aggregated<Vec<Match>>> {
        let days = days.clamp(1, MAX_MATCH_WINDOW_DAYS);
        let today = Utc::now().date_naive();
        let to = today + ChronoDuration::days(i64::from(days));
        let query = MatchQuery {
            league,
            season: self.season,
            from: today,
            to,
        };
        let params = CacheParams::new()
            .with("from", today)
            .with("days", days)
            .with_opt("league", league.map(League::code));
        let window_start = today.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        let window_end = (to + ChronoDuration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc());

        self.aggregate(
            &format!("upcoming {days}d {}", league.map(League::code).unwrap_or("all")),
            UPCOMING_NS,
            &params,
            self.deadline(),
            || match (window_start, window_end) {
                (Some(from), Some(to)) => {
                    self.store
                        .matches_between(from, to, league.map(League::code))
                }
                _ => Ok(Vec::new()),
            },
            move |source, cancel| source.fetch_matches(&query, cancel),
        )
    }

    pub fn get_standings(&self, league: League) -> Result<Aggregated<Vec<Standing>>> {
        let query = StandingsQuery {
            league,
            season: self.season,
        };
        let params = CacheParams::new()
            .with("league", league.code())
            .with("season", self.season);
        self.aggregate(
            &format!("standings of {}", league.code()),
            STANDINGS_NS,
            &params,
            self.deadline(),
            || Ok(Vec::new()),
            move |source, cancel| source.fetch_standings(&query, cancel),
        )
    }

    /// Recent matches handled by referee `name`, newest first, optionally
    /// restricted to those involving `team`.
    pub fn get_referee_history(
        &self,
        name: &str,
        team: Option<&str>,
    ) -> Result<Aggregated<Vec<Match>>> {
        let referee = name.trim().to_string();
        if normalize_person_name(&referee).is_empty() {
            return Err(HubError::validation("referee", "required"));
        }
        let team = team.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
        let params = CacheParams::new()
            .with("name", normalize_person_name(&referee))
            .with_opt("team", team.as_deref().map(normalize_team_name));

        let today = Utc::now().date_naive();
        let from = today - ChronoDuration::days(REFEREE_LOOKBACK_DAYS);
        let leagues = self.default_leagues.clone();
        let season = self.season;
        let keep = {
            let referee = referee.clone();
            let team = team.clone();
            move |m: &Match| {
                m.refereed_by(&referee) && team.as_deref().is_none_or(|t| m.involves_team(t))
            }
        };
        let keep_manual = keep.clone();

        let mut history = self.aggregate(
            &format!("referee {referee}"),
            REFEREES_NS,
            &params,
            self.deadline(),
            || {
                Ok(self
                    .store
                    .refereed_matches()?
                    .into_iter()
                    .filter(|m| keep_manual(m))
                    .collect())
            },
            move |source, cancel| {
                let mut out = Vec::new();
                for league in &leagues {
                    let query = MatchQuery {
                        league: Some(*league),
                        season,
                        from,
                        to: today,
                    };
                    out.extend(
                        source
                            .fetch_matches(&query, cancel)?
                            .into_iter()
                            .filter(|m| keep(m)),
                    );
                }
                Ok(out)
            },
        )?;
        history.value.reverse();
        Ok(history)
    }

    pub fn create_team(&self, input: &TeamInput) -> Result<Team> {
        let team = self.store.create_team(input)?;
        self.invalidate_team_views(&[team.league.as_deref()]);
        Ok(team)
    }

    pub fn update_team(&self, id: i64, input: &TeamInput) -> Result<Team> {
        let before = self
            .store
            .team(id)?
            .ok_or_else(|| HubError::not_found("team", id.to_string()))?;
        let team = self.store.update_team(id, input)?;
        self.invalidate_team_views(&[before.league.as_deref(), team.league.as_deref()]);
        // Renames show up in squads and match rows.
        self.invalidate_namespaces(&[PLAYERS_NS, UPCOMING_NS, REFEREES_NS]);
        Ok(team)
    }

    pub fn delete_team(&self, id: i64) -> Result<Team> {
        let team = self.store.delete_team(id)?;
        self.invalidate_team_views(&[team.league.as_deref()]);
        self.invalidate_namespaces(&[PLAYERS_NS, UPCOMING_NS, REFEREES_NS]);
        Ok(team)
    }

    pub fn create_player(&self, input: &PlayerInput) -> Result<Player> {
        let player = self.store.create_player(input)?;
        self.invalidate_namespaces(&[PLAYERS_NS]);
        Ok(player)
    }

    pub fn update_player(&self, id: i64, input: &PlayerInput) -> Result<Player> {
        let player = self.store.update_player(id, input)?;
        self.invalidate_namespaces(&[PLAYERS_NS]);
        Ok(player)
    }

    pub fn delete_player(&self, id: i64) -> Result<Player> {
        let player = self.store.delete_player(id)?;
        self.invalidate_namespaces(&[PLAYERS_NS]);
        Ok(player)
    }

    pub fn create_match(&self, input: &MatchInput) -> Result<Match> {
        let row = self.store.create_match(input)?;
        self.invalidate_namespaces(&[UPCOMING_NS, REFEREES_NS]);
        Ok(row)
    }

    pub fn update_match(&self, id: i64, input: &MatchInput) -> Result<Match> {
        let row = self.store.update_match(id, input)?;
        self.invalidate_namespaces(&[UPCOMING_NS, REFEREES_NS]);
        Ok(row)
    }

    pub fn delete_match(&self, id: i64) -> Result<Match> {
        let row = self.store.delete_match(id)?;
        self.invalidate_namespaces(&[UPCOMING_NS, REFEREES_NS]);
        Ok(row)
    }

    pub fn explore(&self, sql: &str) -> Result<ExploreResult> {
        self.store.explore(sql)
    }

    /// Drops every cached view in `namespace`.
    pub fn invalidate(&self, namespace: &str) {
        self.cache.invalidate(namespace, None);
    }

    /// Single-team lookups plus the league listings the team appears in.
    fn invalidate_team_views(&self, leagues: &[Option<&str>]) {
        self.cache.invalidate(TEAM_NS, None);
        let mut any_league = false;
        for code in leagues.iter().flatten() {
            any_league = true;
            let params = CacheParams::new()
                .with("league", code)
                .with("season", self.season);
            self.cache.invalidate(TEAMS_NS, Some(&params));
        }
        if !any_league {
            // A team without a league can still match by name in any listing.
            self.cache.invalidate(TEAMS_NS, None);
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.query_timeout
    }

    fn invalidate_namespaces(&self, namespaces: &[&str]) {
        for ns in namespaces {
            self.cache.invalidate(ns, None);
        }
    }

    fn aggregate<T, L, F>(
        &self,
        query: &str,
        namespace: &str,
        params: &CacheParams,
        deadline: Instant,
        manual: L,
        fetch: F,
    ) -> Result<Aggregated<Vec<T>>>
    where
        T: Canonical + Serialize + DeserializeOwned,
        L: FnOnce() -> Result<Vec<T>>,
        F: Fn(&dyn SourceAdapter, &CancelToken) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        if let Some(value) = self.cache.get::<Vec<T>>(namespace, params) {
            debug!(query, state = "cached", "aggregation served from cache");
            return Ok(Aggregated::new(value, Freshness::Fresh));
        }

        debug!(query, state = "fetching", sources = self.sources.len(), "cache miss");
        let started = Instant::now();
        let FanOut {
            batches,
            failures,
            timed_out,
        } = self.fan_out(query, deadline, fetch);

        if batches.is_empty() && !self.sources.is_empty() {
            if let Some(stale) = self.cache.get_stale::<Vec<T>>(namespace, params) {
                warn!(
                    query,
                    state = "failed",
                    age_secs = stale.age.as_secs(),
                    "no source answered, serving stale value"
                );
                return Ok(Aggregated {
                    value: stale.value,
                    freshness: Freshness::Stale,
                    failed_sources: failures,
                });
            }
            let manual = manual()?;
            if !manual.is_empty() {
                warn!(query, state = "failed", "no source answered, serving manual records");
                return Ok(Aggregated {
                    value: merge_records(vec![manual]),
                    freshness: Freshness::Partial,
                    failed_sources: failures,
                });
            }
            warn!(query, state = "failed", "no source answered and nothing cached");
            return Err(HubError::AllSourcesFailed {
                query: query.to_string(),
                failures,
            });
        }

        debug!(query, state = "merging", batches = batches.len(), "merging results");
        let mut all = Vec::with_capacity(batches.len() + 1);
        all.push(manual()?);
        all.extend(batches);
        let merged = merge_records(all);

        if timed_out > 0 {
            info!(
                query,
                timed_out,
                records = merged.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "deadline reached, returning partial result"
            );
            return Ok(Aggregated {
                value: merged,
                freshness: Freshness::Partial,
                failed_sources: failures,
            });
        }

        if let Err(err) = self.cache.set(namespace, params, &merged) {
            warn!(query, error = %err, "failed to cache aggregated value");
        }
        debug!(
            query,
            state = "cached",
            records = merged.len(),
            failed = failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation complete"
        );
        Ok(Aggregated {
            value: merged,
            freshness: Freshness::Fetched,
            failed_sources: failures,
        })
    }

    /// Runs `fetch` against every source on the worker pool and joins on all
    /// of them, up to `deadline`. Late results are discarded.
    fn fan_out<T, F>(&self, query: &str, deadline: Instant, fetch: F) -> FanOut<T>
    where
        T: Send + 'static,
        F: Fn(&dyn SourceAdapter, &CancelToken) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        let fetch = Arc::new(fetch);
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();

        for (idx, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let fetch = Arc::clone(&fetch);
            let cancel = cancel.clone();
            let tx = tx.clone();
            let job = move || {
                let result = cancel
                    .check()
                    .and_then(|()| (*fetch)(source.as_ref(), &cancel));
                // The receiver is gone once the deadline passed.
                let _ = tx.send((idx, result));
            };
            match self.workers.as_deref() {
                Some(pool) => pool.spawn(job),
                None => {
                    thread::spawn(job);
                }
            }
        }
        drop(tx);

        let mut slots: Vec<Option<Result<Vec<T>>>> = self.sources.iter().map(|_| None).collect();
        let mut received = 0;
        let mut expired = false;
        while received < slots.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((idx, result)) => {
                    slots[idx] = Some(result);
                    received += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    expired = true;
                    cancel.cancel();
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut out = FanOut {
            batches: Vec::new(),
            failures: Vec::new(),
            timed_out: 0,
        };
        for (source, slot) in self.sources.iter().zip(slots) {
            let id = source.source_id();
            match slot {
                Some(Ok(batch)) => {
                    debug!(query, source = id, records = batch.len(), "source answered");
                    out.batches.push(batch);
                }
                Some(Err(err)) => {
                    warn!(query, source = id, error = %err, "source failed");
                    out.failures.push(format!("{id}: {err}"));
                }
                None if expired => {
                    warn!(query, source = id, "source abandoned at deadline");
                    out.failures.push(format!("{id}: deadline exceeded"));
                    out.timed_out += 1;
                }
                None => {
                    warn!(query, source = id, "source worker stopped without a result");
                    out.failures.push(format!("{id}: worker stopped"));
                }
            }
        }
        out
    }
}
