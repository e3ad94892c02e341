use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use matchday_hub::cache::{ManualClock, TieredCache};
use matchday_hub::cancel::CancelToken;
use matchday_hub::config::{AggregatorConfig, CacheConfig, PoolConfig};
use matchday_hub::entity::{Match, MatchStatus, Player, Standing, Team};
use matchday_hub::error::{HubError, Result};
use matchday_hub::leagues::League;
use matchday_hub::pool::ConnectionPool;
use matchday_hub::sources::{MatchQuery, PlayerQuery, SourceAdapter, StandingsQuery, TeamQuery};
use matchday_hub::store::{MatchInput, PlayerInput, Store, TeamInput};
use matchday_hub::{Aggregator, Freshness};

const DISK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
enum Script {
    Answer,
    Fail,
    Hang,
}

/// In-memory provider with a switchable behaviour.
struct FakeSource {
    id: &'static str,
    teams: Vec<Team>,
    players: Vec<Player>,
    matches: Vec<Match>,
    standings: Vec<Standing>,
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl FakeSource {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            teams: Vec::new(),
            players: Vec::new(),
            matches: Vec::new(),
            standings: Vec::new(),
            script: Mutex::new(Script::Answer),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_teams(mut self, teams: Vec<Team>) -> Self {
        self.teams = teams;
        self
    }

    fn with_players(mut self, players: Vec<Player>) -> Self {
        self.players = players;
        self
    }

    fn with_matches(mut self, matches: Vec<Match>) -> Self {
        self.matches = matches;
        self
    }

    fn with_standings(mut self, standings: Vec<Standing>) -> Self {
        self.standings = standings;
        self
    }

    fn script(self, script: Script) -> Self {
        *self.script.lock().unwrap() = script;
        self
    }

    fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond<T: Clone>(&self, rows: Vec<T>, cancel: &CancelToken) -> Result<Vec<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        match script {
            Script::Answer => Ok(rows),
            Script::Fail => Err(HubError::source_unavailable(self.id, "http 503")),
            Script::Hang => {
                cancel.sleep(Duration::from_secs(30))?;
                Ok(rows)
            }
        }
    }
}

impl SourceAdapter for FakeSource {
    fn source_id(&self) -> &'static str {
        self.id
    }

    fn fetch_teams(&self, _query: &TeamQuery, cancel: &CancelToken) -> Result<Vec<Team>> {
        self.respond(self.teams.clone(), cancel)
    }

    fn fetch_players(&self, query: &PlayerQuery, cancel: &CancelToken) -> Result<Vec<Player>> {
        let rows = self
            .players
            .iter()
            .filter(|p| p.team_name.as_deref() == Some(query.team.name.as_str()))
            .cloned()
            .collect();
        self.respond(rows, cancel)
    }

    fn fetch_matches(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>> {
        let rows = self
            .matches
            .iter()
            .filter(|m| query.contains(&m.kickoff))
            .filter(|m| {
                query
                    .league
                    .is_none_or(|l| m.league.as_deref() == Some(l.code()))
            })
            .cloned()
            .collect();
        self.respond(rows, cancel)
    }

    fn fetch_standings(
        &self,
        _query: &StandingsQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Standing>> {
        self.respond(self.standings.clone(), cancel)
    }
}

struct Harness {
    hub: Aggregator,
    clock: Arc<ManualClock>,
    sources: Vec<Arc<FakeSource>>,
    _dir: tempfile::TempDir,
}

fn harness(sources: Vec<FakeSource>, timeout: Duration) -> Harness {
    harness_with_leagues(sources, timeout, vec![League::LaLiga])
}

fn harness_with_leagues(
    sources: Vec<FakeSource>,
    timeout: Duration,
    default_leagues: Vec<League>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_700_000_000.0));
    let cache = Arc::new(TieredCache::with_clock(
        &CacheConfig {
            dir: dir.path().join("cache"),
            memory_ttl: Duration::from_secs(60),
            disk_ttl: DISK_TTL,
            stale_max_age: Duration::from_secs(86_400),
            memory_capacity: 64,
        },
        clock.clone(),
    ));
    let pool = ConnectionPool::new(&PoolConfig {
        db_path: dir.path().join("hub.db"),
        max_connections: 4,
        acquire_attempts: 5,
        acquire_base_delay: Duration::from_millis(5),
        busy_timeout: Duration::from_secs(2),
    })
    .expect("pool");
    let store = Store::open(Arc::new(pool)).expect("store");

    let sources: Vec<Arc<FakeSource>> = sources.into_iter().map(Arc::new).collect();
    let adapters: Vec<Arc<dyn SourceAdapter>> = sources
        .iter()
        .map(|s| {
            let adapter: Arc<dyn SourceAdapter> = s.clone();
            adapter
        })
        .collect();
    let hub = Aggregator::new(
        &AggregatorConfig {
            fetch_parallelism: 4,
            query_timeout: timeout,
            default_leagues,
            season: 2025,
        },
        adapters,
        cache,
        store,
    );
    Harness {
        hub,
        clock,
        sources,
        _dir: dir,
    }
}

fn team(source: &str, id: &str, name: &str, stadium: Option<&str>) -> Team {
    let mut team = Team::new(source, id, name);
    team.league = Some("PD".to_string());
    team.stadium = stadium.map(str::to_string);
    team
}

fn liga_sources() -> Vec<FakeSource> {
    vec![
        FakeSource::new("football_data").with_teams(vec![
            team("football_data", "fd:86", "Real Madrid", None),
            team("football_data", "fd:82", "Getafe CF", Some("Coliseum")),
        ]),
        FakeSource::new("api_football").with_teams(vec![
            team("api_football", "af:541", "real madrid", Some("Bernabéu")),
            team("api_football", "af:529", "Barcelona", Some("Montjuïc")),
        ]),
        FakeSource::new("fotmob").script(Script::Fail),
    ]
}

#[test]
fn one_failing_source_still_yields_a_merged_listing() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    let listing = h.hub.get_teams(League::LaLiga).expect("teams");

    assert_eq!(listing.freshness, Freshness::Fetched);
    assert_eq!(listing.failed_sources.len(), 1);
    assert!(listing.failed_sources[0].starts_with("fotmob:"));

    let names: Vec<&str> = listing.value.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Barcelona", "Getafe CF", "Real Madrid"]);

    let madrid = listing
        .value
        .iter()
        .find(|t| t.name == "Real Madrid")
        .expect("merged madrid");
    assert_eq!(madrid.id, "fd:86", "first source keeps its id");
    assert_eq!(madrid.stadium.as_deref(), Some("Bernabéu"), "gap filled by later source");
    assert_eq!(madrid.external_ids.get("api_football").map(String::as_str), Some("af:541"));
}

#[test]
fn second_call_is_served_from_cache() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    h.hub.get_teams(League::LaLiga).expect("teams");
    let again = h.hub.get_teams(League::LaLiga).expect("teams");

    assert_eq!(again.freshness, Freshness::Fresh);
    assert_eq!(again.value.len(), 3);
    assert!(h.sources.iter().all(|s| s.calls() == 1));
}

#[test]
fn all_sources_failing_falls_back_to_stale_copy() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    let first = h.hub.get_teams(League::LaLiga).expect("teams");

    h.clock.advance(DISK_TTL + Duration::from_secs(60));
    for source in &h.sources {
        source.set_script(Script::Fail);
    }
    let stale = h.hub.get_teams(League::LaLiga).expect("stale teams");
    assert_eq!(stale.freshness, Freshness::Stale);
    assert!(stale.is_stale());
    assert_eq!(stale.value, first.value);
    assert_eq!(stale.failed_sources.len(), 3);
}

#[test]
fn all_sources_failing_with_nothing_cached_is_an_error() {
    let sources = vec![
        FakeSource::new("football_data").script(Script::Fail),
        FakeSource::new("api_football").script(Script::Fail),
        FakeSource::new("fotmob").script(Script::Fail),
    ];
    let h = harness(sources, Duration::from_secs(5));
    match h.hub.get_standings(League::LaLiga) {
        Err(HubError::AllSourcesFailed { query, failures }) => {
            assert!(query.contains("PD"));
            assert_eq!(failures.len(), 3);
        }
        other => panic!("expected AllSourcesFailed, got {other:?}"),
    }
}

#[test]
fn manual_records_answer_when_every_source_fails() {
    let sources = vec![FakeSource::new("football_data").script(Script::Fail)];
    let h = harness(sources, Duration::from_secs(5));
    h.hub
        .create_team(&TeamInput {
            name: Some("CD Leganés".into()),
            league: Some("PD".into()),
            ..TeamInput::default()
        })
        .expect("create");

    let listing = h.hub.get_teams(League::LaLiga).expect("manual teams");
    assert_eq!(listing.freshness, Freshness::Partial);
    assert_eq!(listing.value.len(), 1);
    assert_eq!(listing.value[0].source, "manual");
}

#[test]
fn deadline_returns_partial_result_without_caching_it() {
    let sources = vec![
        FakeSource::new("football_data")
            .with_teams(vec![team("football_data", "fd:86", "Real Madrid", None)]),
        FakeSource::new("fotmob")
            .with_teams(vec![team("fotmob", "fm:8633", "Real Madrid", Some("Bernabéu"))])
            .script(Script::Hang),
    ];
    let h = harness(sources, Duration::from_millis(300));

    let started = Instant::now();
    let listing = h.hub.get_teams(League::LaLiga).expect("partial");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(listing.freshness, Freshness::Partial);
    assert_eq!(listing.value.len(), 1);
    assert_eq!(listing.value[0].stadium, None);
    assert!(listing.failed_sources.iter().any(|f| f.contains("deadline")));

    h.sources[1].set_script(Script::Answer);
    let complete = h.hub.get_teams(League::LaLiga).expect("complete");
    assert_eq!(complete.freshness, Freshness::Fetched, "partial result was not cached");
    assert_eq!(complete.value[0].stadium.as_deref(), Some("Bernabéu"));
}

#[test]
fn one_deadline_covers_every_league_searched_for_a_squad() {
    let sources = vec![FakeSource::new("fotmob").script(Script::Hang)];
    let h = harness_with_leagues(
        sources,
        Duration::from_millis(300),
        vec![League::LaLiga, League::PremierLeague, League::SerieA],
    );

    let started = Instant::now();
    let result = h.hub.get_players_of_team("Nonexistent United");
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    assert!(matches!(result, Err(HubError::AllSourcesFailed { .. })), "{result:?}");
}

#[test]
fn team_search_stops_at_the_deadline_and_reports_skipped_leagues() {
    let sources = vec![
        FakeSource::new("football_data")
            .with_teams(vec![team("football_data", "fd:86", "Real Madrid", None)]),
        FakeSource::new("fotmob").script(Script::Hang),
    ];
    let h = harness_with_leagues(
        sources,
        Duration::from_millis(250),
        vec![League::PremierLeague, League::SerieA, League::LaLiga],
    );

    let started = Instant::now();
    let result = h.hub.get_team("Nonexistent United");
    assert!(started.elapsed() < Duration::from_millis(500));
    match result {
        Err(HubError::AllSourcesFailed { query, failures }) => {
            assert!(query.contains("Nonexistent United"));
            assert!(failures.iter().any(|f| f.starts_with("teams of SA")));
            assert!(failures.iter().any(|f| f.starts_with("teams of PD")));
        }
        other => panic!("expected the search to be cut short, got {other:?}"),
    }
}

#[test]
fn caller_deadline_serves_stale_copy_while_every_source_hangs() {
    let h = harness(liga_sources(), Duration::from_secs(30));
    h.sources[2].set_script(Script::Answer);
    let first = h.hub.get_teams(League::LaLiga).expect("teams");

    h.clock.advance(DISK_TTL + Duration::from_secs(60));
    for source in &h.sources {
        source.set_script(Script::Hang);
    }
    let hurried = h.hub.with_deadline(Duration::from_millis(200));

    let started = Instant::now();
    let stale = hurried.get_teams(League::LaLiga).expect("stale teams");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stale.freshness, Freshness::Stale);
    assert_eq!(stale.value, first.value);
    assert_eq!(stale.failed_sources.len(), 3);
    assert!(stale.failed_sources.iter().all(|f| f.contains("deadline")));
}

#[test]
fn writes_invalidate_dependent_views() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    assert_eq!(h.hub.get_teams(League::LaLiga).expect("teams").value.len(), 3);
    assert_eq!(
        h.hub.get_teams(League::LaLiga).expect("teams").freshness,
        Freshness::Fresh
    );

    let created = h
        .hub
        .create_team(&TeamInput {
            name: Some("Getafe".into()),
            league: Some("PD".into()),
            coach: Some("José Bordalás".into()),
            ..TeamInput::default()
        })
        .expect("create");

    let listing = h.hub.get_teams(League::LaLiga).expect("teams");
    assert_eq!(listing.freshness, Freshness::Fetched);
    assert_eq!(listing.value.len(), 3, "manual Getafe merges with Getafe CF");
    let getafe = listing
        .value
        .iter()
        .find(|t| t.name == "Getafe")
        .expect("manual record wins");
    assert_eq!(getafe.id, created.id);
    assert_eq!(getafe.coach.as_deref(), Some("José Bordalás"));
    assert_eq!(getafe.stadium.as_deref(), Some("Coliseum"));

    let id: i64 = created.id.parse().expect("numeric id");
    h.hub.delete_team(id).expect("delete");
    let listing = h.hub.get_teams(League::LaLiga).expect("teams");
    assert_eq!(listing.freshness, Freshness::Fetched);
    assert!(listing.value.iter().all(|t| t.source != "manual"));
}

#[test]
fn team_lookup_by_name_or_provider_id() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    let by_name = h.hub.get_team("REAL MADRID").expect("by name");
    assert_eq!(by_name.value.id, "fd:86");

    let by_id = h.hub.get_team("af:529").expect("by provider id");
    assert_eq!(by_id.value.name, "Barcelona");

    assert!(matches!(
        h.hub.get_team("Atlético Madrid"),
        Err(HubError::NotFound { .. })
    ));
    assert!(matches!(h.hub.get_team("  "), Err(HubError::Validation { .. })));
}

#[test]
fn squad_merges_providers_and_manual_players() {
    let mut bellingham = Player::new("football_data", "fd:p44", "Jude Bellingham");
    bellingham.team_name = Some("Real Madrid".to_string());
    let mut bellingham_af = Player::new("api_football", "af:p129718", "Jude Bellingham");
    bellingham_af.team_name = Some("Real Madrid".to_string());
    bellingham_af.shirt_number = Some(5);

    let sources = vec![
        FakeSource::new("football_data")
            .with_teams(vec![team("football_data", "fd:86", "Real Madrid", None)])
            .with_players(vec![bellingham]),
        FakeSource::new("api_football").with_players(vec![bellingham_af]),
    ];
    let h = harness(sources, Duration::from_secs(5));

    let squad = h.hub.get_players_of_team("Real Madrid").expect("squad");
    assert_eq!(squad.freshness, Freshness::Fetched);
    assert_eq!(squad.value.len(), 1);
    assert_eq!(squad.value[0].shirt_number, Some(5));
    assert_eq!(squad.value[0].external_ids.len(), 2);
}

#[test]
fn manual_team_squad_includes_store_players() {
    let h = harness(vec![FakeSource::new("fotmob")], Duration::from_secs(5));
    let club = h
        .hub
        .create_team(&TeamInput {
            name: Some("Atlético Sanluqueño".into()),
            ..TeamInput::default()
        })
        .expect("team");
    let club_id: i64 = club.id.parse().expect("id");
    h.hub
        .create_player(&PlayerInput {
            name: Some("Juan Pérez".into()),
            team_id: Some(club_id),
            shirt_number: Some(9),
            ..PlayerInput::default()
        })
        .expect("player");

    let squad = h.hub.get_players_of_team(&club.id).expect("squad");
    assert_eq!(squad.value.len(), 1);
    assert_eq!(squad.value[0].name, "Juan Pérez");
    assert_eq!(squad.value[0].team_name.as_deref(), Some("Atlético Sanluqueño"));
}

#[test]
fn upcoming_matches_cover_the_window_only() {
    let now = Utc::now();
    let day = |n: i64| now + ChronoDuration::days(n);
    let mut soon = Match::new("football_data", "fd:m1", day(2), "Real Madrid", "Getafe");
    soon.league = Some("PD".to_string());
    soon.status = MatchStatus::Scheduled;
    let mut later = Match::new("football_data", "fd:m2", day(40), "Getafe", "Barcelona");
    later.league = Some("PD".to_string());
    let mut same = Match::new("fotmob", "fm:m1", day(2), "Real Madrid CF", "Getafe CF");
    same.league = Some("PD".to_string());
    same.venue = Some("Bernabéu".to_string());

    let sources = vec![
        FakeSource::new("football_data").with_matches(vec![soon, later]),
        FakeSource::new("fotmob").with_matches(vec![same]),
    ];
    let h = harness(sources, Duration::from_secs(5));

    let upcoming = h
        .hub
        .get_upcoming_matches(7, Some(League::LaLiga))
        .expect("upcoming");
    assert_eq!(upcoming.value.len(), 1);
    assert_eq!(upcoming.value[0].id, "fd:m1");
    assert_eq!(upcoming.value[0].venue.as_deref(), Some("Bernabéu"));
}

#[test]
fn referee_history_is_newest_first_and_filters_by_team() {
    let now = Utc::now();
    let refereed = |id: &str, days_ago: i64, home: &str, away: &str| {
        let kickoff = now - ChronoDuration::days(days_ago);
        let mut m = Match::new("api_football", id, kickoff, home, away);
        m.league = Some("PD".to_string());
        m.referee = Some("Jesús Gil Manzano".to_string());
        m.status = MatchStatus::Finished;
        m
    };
    let mut other = refereed("af:m9", 3, "Sevilla", "Betis");
    other.referee = Some("Mateu Lahoz".to_string());

    let sources = vec![FakeSource::new("api_football").with_matches(vec![
        refereed("af:m1", 20, "Real Madrid", "Getafe"),
        refereed("af:m2", 5, "Barcelona", "Sevilla"),
        refereed("af:m3", 12, "Getafe", "Valencia"),
        refereed("af:m4", 200, "Getafe", "Osasuna"),
        other,
    ])];
    let h = harness(sources, Duration::from_secs(5));

    let history = h
        .hub
        .get_referee_history("jesus gil manzano", None)
        .expect("history");
    let ids: Vec<&str> = history.value.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["af:m2", "af:m3", "af:m1"]);

    let with_getafe = h
        .hub
        .get_referee_history("Gil Manzano", Some("Getafe"))
        .expect("history");
    let ids: Vec<&str> = with_getafe.value.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["af:m3", "af:m1"]);
}

#[test]
fn manual_matches_are_part_of_referee_history() {
    let h = harness(vec![FakeSource::new("api_football")], Duration::from_secs(5));
    let mk = |name: &str| {
        h.hub
            .create_team(&TeamInput {
                name: Some(name.into()),
                league: Some("PD".into()),
                ..TeamInput::default()
            })
            .expect("team")
            .id
            .parse::<i64>()
            .expect("id")
    };
    let home = mk("Rayo Vallecano");
    let away = mk("Alavés");
    h.hub
        .create_match(&MatchInput {
            kickoff: Some(Utc::now() - ChronoDuration::days(2)),
            home_team_id: Some(home),
            away_team_id: Some(away),
            home_goals: Some(1),
            away_goals: Some(1),
            status: Some(MatchStatus::Finished),
            referee: Some("Alejandro Hernández".into()),
            ..MatchInput::default()
        })
        .expect("match");

    let history = h.hub.get_referee_history("Hernandez", None).expect("history");
    assert_eq!(history.value.len(), 1);
    assert_eq!(history.value[0].home, "Rayo Vallecano");
    assert_eq!(history.value[0].league.as_deref(), Some("PD"));
}

#[test]
fn standings_merge_and_sort_by_position() {
    let row = |source: &str, name: &str, position: Option<u16>, points: Option<u16>| {
        let mut s = Standing::new(source, "PD", name);
        s.position = position;
        s.points = points;
        s
    };
    let sources = vec![
        FakeSource::new("football_data").with_standings(vec![
            row("football_data", "Barcelona", Some(2), None),
            row("football_data", "Real Madrid", Some(1), Some(64)),
        ]),
        FakeSource::new("fotmob")
            .with_standings(vec![row("fotmob", "Barcelona", Some(2), Some(60))]),
    ];
    let h = harness(sources, Duration::from_secs(5));
    let table = h.hub.get_standings(League::LaLiga).expect("standings");
    let rows: Vec<(&str, Option<u16>)> = table
        .value
        .iter()
        .map(|s| (s.team.as_str(), s.points))
        .collect();
    assert_eq!(rows, vec![("Real Madrid", Some(64)), ("Barcelona", Some(60))]);
}

#[test]
fn explicit_invalidation_forces_a_refetch() {
    let h = harness(liga_sources(), Duration::from_secs(5));
    h.hub.get_teams(League::LaLiga).expect("teams");
    h.hub.invalidate("teams");
    assert_eq!(
        h.hub.get_teams(League::LaLiga).expect("teams").freshness,
        Freshness::Fetched
    );
    assert!(h.sources.iter().all(|s| s.calls() == 2));
}

#[test]
fn explorer_is_reachable_through_the_aggregator() {
    let h = harness(Vec::new(), Duration::from_secs(5));
    h.hub
        .create_team(&TeamInput {
            name: Some("Elche".into()),
            ..TeamInput::default()
        })
        .expect("team");
    let result = h.hub.explore("SELECT nombre FROM equipos").expect("explore");
    assert_eq!(result.rows, vec![vec!["Elche".to_string()]]);
    assert!(matches!(
        h.hub.explore("DELETE FROM equipos"),
        Err(HubError::ExplorerDenied { .. })
    ));
    let stats = h.hub.stats();
    assert_eq!(stats.pool.in_use, 0);
}
