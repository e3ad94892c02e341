use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use matchday_hub::config::PoolConfig;
use matchday_hub::entity::MatchStatus;
use matchday_hub::error::HubError;
use matchday_hub::pool::ConnectionPool;
use matchday_hub::store::{MatchInput, PlayerInput, Store, TeamInput};

fn open_store(dir: &tempfile::TempDir) -> Store {
    let pool = ConnectionPool::new(&PoolConfig {
        db_path: dir.path().join("hub.db"),
        max_connections: 3,
        acquire_attempts: 5,
        acquire_base_delay: Duration::from_millis(5),
        busy_timeout: Duration::from_secs(2),
    })
    .expect("pool");
    Store::open(Arc::new(pool)).expect("store")
}

fn team_input(name: &str, league: Option<&str>) -> TeamInput {
    TeamInput {
        name: Some(name.to_string()),
        league: league.map(str::to_string),
        ..TeamInput::default()
    }
}

fn id_of(raw: &str) -> i64 {
    raw.parse().expect("numeric store id")
}

fn field_of(err: HubError) -> String {
    match err {
        HubError::Validation { field, .. } => field,
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn team_crud_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);

    let created = store
        .create_team(&TeamInput {
            name: Some("Real Sociedad".into()),
            short_name: Some("Sociedad".into()),
            league: Some("pd".into()),
            country: Some("Spain".into()),
            stadium: Some("Reale Arena".into()),
            founded: Some(1909),
            coach: Some("Sergio Francisco".into()),
        })
        .expect("create");
    assert_eq!(created.source, "manual");
    assert_eq!(created.league.as_deref(), Some("PD"));
    assert_eq!(created.external_ids.get("manual"), Some(&created.id));

    let id = id_of(&created.id);
    let updated = store
        .update_team(id, &TeamInput {
            stadium: Some("Anoeta".into()),
            ..team_input("Real Sociedad", Some("PD"))
        })
        .expect("update");
    assert_eq!(updated.stadium.as_deref(), Some("Anoeta"));
    assert_eq!(updated.coach, None, "update replaces every field");

    assert_eq!(store.teams(Some("PD")).expect("list").len(), 1);
    assert!(store.teams(Some("PL")).expect("list").is_empty());
    assert_eq!(store.find_teams("real sociedad").expect("find").len(), 1);
    assert_eq!(store.find_teams(&created.id).expect("find").len(), 1);

    let deleted = store.delete_team(id).expect("delete");
    assert_eq!(deleted.name, "Real Sociedad");
    assert!(store.team(id).expect("get").is_none());
    assert!(matches!(store.delete_team(id), Err(HubError::NotFound { .. })));
    assert!(matches!(
        store.update_team(id, &team_input("Ghost", None)),
        Err(HubError::NotFound { .. })
    ));
}

#[test]
fn team_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);

    let blank = store.create_team(&team_input("   ", None)).expect_err("blank name");
    assert_eq!(field_of(blank), "name");

    let league = store
        .create_team(&team_input("Somewhere", Some("MLS")))
        .expect_err("unknown league");
    assert_eq!(field_of(league), "league");

    let founded = store
        .create_team(&TeamInput {
            founded: Some(1700),
            ..team_input("Ancient", None)
        })
        .expect_err("too old");
    assert_eq!(field_of(founded), "founded");

    assert!(store.teams(None).expect("list").is_empty(), "nothing was written");
}

#[test]
fn player_validation_and_team_reference() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);

    let shirt = store
        .create_player(&PlayerInput {
            name: Some("Iker".into()),
            shirt_number: Some(0),
            ..PlayerInput::default()
        })
        .expect_err("shirt 0");
    assert_eq!(field_of(shirt), "shirt_number");

    let born = store
        .create_player(&PlayerInput {
            name: Some("Future".into()),
            birth_date: NaiveDate::from_ymd_opt(2999, 1, 1),
            ..PlayerInput::default()
        })
        .expect_err("future birth");
    assert_eq!(field_of(born), "birth_date");

    let missing_team = store
        .create_player(&PlayerInput {
            name: Some("Orphan".into()),
            team_id: Some(404),
            ..PlayerInput::default()
        })
        .expect_err("missing team");
    assert_eq!(field_of(missing_team), "team_id");
}

#[test]
fn deleting_a_team_keeps_players_and_matches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let home = id_of(&store.create_team(&team_input("Osasuna", Some("PD"))).expect("team").id);
    let away = id_of(&store.create_team(&team_input("Girona", Some("PD"))).expect("team").id);

    let player = store
        .create_player(&PlayerInput {
            name: Some("Ante Budimir".into()),
            team_id: Some(home),
            position: Some("Forward".into()),
            birth_date: NaiveDate::from_ymd_opt(1991, 7, 22),
            shirt_number: Some(17),
            ..PlayerInput::default()
        })
        .expect("player");
    assert_eq!(player.team_name.as_deref(), Some("Osasuna"));
    assert_eq!(store.players_of_team(home).expect("squad").len(), 1);

    let kickoff = Utc.with_ymd_and_hms(2026, 4, 12, 16, 15, 0).unwrap();
    let row = store
        .create_match(&MatchInput {
            kickoff: Some(kickoff),
            home_team_id: Some(home),
            away_team_id: Some(away),
            referee: Some("Guillermo Cuadra Fernández".into()),
            ..MatchInput::default()
        })
        .expect("match");
    assert_eq!(row.home, "Osasuna");
    assert_eq!(row.league.as_deref(), Some("PD"), "league defaults to the home team's");
    assert_eq!(row.status, MatchStatus::Scheduled);

    store.delete_team(home).expect("delete");

    let orphan = store.player(id_of(&player.id)).expect("get").expect("kept");
    assert_eq!(orphan.team_id, None);
    let kept = store.match_by_id(id_of(&row.id)).expect("get").expect("kept");
    assert_eq!(kept.home_id, None);
    assert_eq!(kept.home, "Osasuna", "name snapshot survives");
    assert_eq!(kept.away_id.as_deref(), Some(away.to_string().as_str()));
}

#[test]
fn match_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let a = id_of(&store.create_team(&team_input("Mallorca", None)).expect("team").id);
    let b = id_of(&store.create_team(&team_input("Celta", None)).expect("team").id);
    let kickoff = Some(Utc.with_ymd_and_hms(2026, 5, 1, 19, 0, 0).unwrap());

    let no_kickoff = store
        .create_match(&MatchInput {
            home_team_id: Some(a),
            away_team_id: Some(b),
            ..MatchInput::default()
        })
        .expect_err("kickoff");
    assert_eq!(field_of(no_kickoff), "kickoff");

    let itself = store
        .create_match(&MatchInput {
            kickoff,
            home_team_id: Some(a),
            away_team_id: Some(a),
            ..MatchInput::default()
        })
        .expect_err("same team");
    assert_eq!(field_of(itself), "away_team_id");

    let half_score = store
        .create_match(&MatchInput {
            kickoff,
            home_team_id: Some(a),
            away_team_id: Some(b),
            home_goals: Some(2),
            ..MatchInput::default()
        })
        .expect_err("one-sided score");
    assert_eq!(field_of(half_score), "goals");

    let missing = store
        .create_match(&MatchInput {
            kickoff,
            home_team_id: Some(a),
            away_team_id: Some(999),
            ..MatchInput::default()
        })
        .expect_err("missing team");
    assert_eq!(field_of(missing), "team_id");
}

#[test]
fn renaming_a_team_updates_match_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let a = id_of(&store.create_team(&team_input("Athletic", Some("PD"))).expect("team").id);
    let b = id_of(&store.create_team(&team_input("Villarreal", Some("PD"))).expect("team").id);
    let row = store
        .create_match(&MatchInput {
            kickoff: Some(Utc.with_ymd_and_hms(2026, 3, 14, 20, 0, 0).unwrap()),
            home_team_id: Some(a),
            away_team_id: Some(b),
            home_goals: Some(1),
            away_goals: Some(0),
            status: Some(MatchStatus::Finished),
            ..MatchInput::default()
        })
        .expect("match");

    store
        .update_team(a, &team_input("Athletic Club", Some("PD")))
        .expect("rename");
    let row = store.match_by_id(id_of(&row.id)).expect("get").expect("row");
    assert_eq!(row.home, "Athletic Club");
    assert_eq!((row.home_goals, row.away_goals), (Some(1), Some(0)));
}

#[test]
fn failed_rename_leaves_team_and_snapshots_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let a = id_of(&store.create_team(&team_input("Osasuna", Some("PD"))).expect("team").id);
    let b = id_of(&store.create_team(&team_input("Alavés", Some("PD"))).expect("team").id);
    let row = store
        .create_match(&MatchInput {
            kickoff: Some(Utc.with_ymd_and_hms(2026, 4, 4, 16, 15, 0).unwrap()),
            home_team_id: Some(b),
            away_team_id: Some(a),
            ..MatchInput::default()
        })
        .expect("match");
    {
        let conn = store.pool().acquire().expect("conn");
        conn.execute_batch(
            "CREATE TRIGGER no_away_rename BEFORE UPDATE OF visitante_nombre ON partidos
             BEGIN SELECT RAISE(ABORT, 'away names are frozen'); END;",
        )
        .expect("trigger");
    }

    assert!(store.update_team(a, &team_input("CA Osasuna", Some("PD"))).is_err());
    let team = store.team(a).expect("get").expect("team");
    assert_eq!(team.name, "Osasuna", "team update rolled back with the snapshots");
    let row = store.match_by_id(id_of(&row.id)).expect("get").expect("row");
    assert_eq!(row.away, "Osasuna");
}

#[test]
fn matches_between_is_half_open_and_filters_league() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let a = id_of(&store.create_team(&team_input("Sevilla", Some("PD"))).expect("team").id);
    let b = id_of(&store.create_team(&team_input("Betis", Some("PD"))).expect("team").id);
    for day in [1, 2, 3] {
        store
            .create_match(&MatchInput {
                kickoff: Some(Utc.with_ymd_and_hms(2026, 5, day, 0, 0, 0).unwrap()),
                home_team_id: Some(a),
                away_team_id: Some(b),
                ..MatchInput::default()
            })
            .expect("match");
    }
    let from = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2026, 5, 3, 0, 0, 0).unwrap();
    assert_eq!(store.matches_between(from, to, None).expect("range").len(), 2);
    assert_eq!(store.matches_between(from, to, Some("PD")).expect("range").len(), 2);
    assert!(store.matches_between(from, to, Some("PL")).expect("range").is_empty());
}

#[test]
fn explorer_reads_but_never_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    store.create_team(&team_input("Valencia", Some("PD"))).expect("team");
    store.create_team(&team_input("Levante", None)).expect("team");

    let result = store
        .explore("SELECT nombre, liga, fundado FROM equipos ORDER BY id")
        .expect("select");
    assert_eq!(result.columns, vec!["nombre", "liga", "fundado"]);
    assert_eq!(
        result.rows,
        vec![
            vec!["Valencia".to_string(), "PD".to_string(), "NULL".to_string()],
            vec!["Levante".to_string(), "NULL".to_string(), "NULL".to_string()],
        ]
    );
    assert!(!result.truncated);

    let with = store
        .explore("WITH n AS (SELECT COUNT(*) AS c FROM equipos) SELECT c FROM n")
        .expect("with");
    assert_eq!(with.rows, vec![vec!["2".to_string()]]);

    let literal = store
        .explore("SELECT nombre FROM equipos WHERE nombre <> 'a;b' ORDER BY id;")
        .expect("semicolon inside a literal");
    assert_eq!(literal.rows.len(), 2);

    for sql in [
        "DROP TABLE equipos",
        "SELECT 1; DELETE FROM equipos",
        "INSERT INTO equipos(nombre, creado_en) VALUES ('x', 'y')",
        "ATTACH DATABASE 'other.db' AS other",
    ] {
        assert!(
            matches!(store.explore(sql), Err(HubError::ExplorerDenied { .. })),
            "{sql} should be denied"
        );
    }
    assert_eq!(store.teams(None).expect("list").len(), 2);
}

#[test]
fn explorer_truncates_large_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let result = store
        .explore(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 1500) \
             SELECT x FROM n",
        )
        .expect("recursive select");
    assert_eq!(result.rows.len(), 1000);
    assert!(result.truncated);
}
