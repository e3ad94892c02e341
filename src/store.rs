//! Manually entered teams, players and matches, kept in the pooled SQLite
//! database. Every statement is parameterized except `explore`, which only
//! accepts a single read-only query.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entity::{MANUAL_SOURCE, Match, MatchStatus, Player, Team};
use crate::error::{HubError, Result};
use crate::leagues::League;
use crate::pool::{ConnectionPool, PooledConnection};

const EXPLORE_MAX_ROWS: usize = 1000;

static WRITE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|REPLACE|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX)\b",
    )
    .expect("Invalid explorer keyword regex")
});

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS equipos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nombre TEXT NOT NULL,
            nombre_corto TEXT NULL,
            liga TEXT NULL,
            pais TEXT NULL,
            estadio TEXT NULL,
            fundado INTEGER NULL,
            entrenador TEXT NULL,
            creado_en TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_equipos_liga ON equipos(liga);

        CREATE TABLE IF NOT EXISTS jugadores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nombre TEXT NOT NULL,
            equipo_id INTEGER NULL REFERENCES equipos(id) ON DELETE SET NULL,
            posicion TEXT NULL,
            nacionalidad TEXT NULL,
            fecha_nacimiento TEXT NULL,
            dorsal INTEGER NULL,
            creado_en TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jugadores_equipo ON jugadores(equipo_id);

        CREATE TABLE IF NOT EXISTS partidos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fecha TEXT NOT NULL,
            liga TEXT NULL,
            equipo_local_id INTEGER NULL REFERENCES equipos(id) ON DELETE SET NULL,
            equipo_visitante_id INTEGER NULL REFERENCES equipos(id) ON DELETE SET NULL,
            local_nombre TEXT NOT NULL,
            visitante_nombre TEXT NOT NULL,
            goles_local INTEGER NULL,
            goles_visitante INTEGER NULL,
            estado TEXT NOT NULL,
            arbitro TEXT NULL,
            estadio TEXT NULL,
            jornada TEXT NULL,
            creado_en TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_partidos_fecha ON partidos(fecha);
        CREATE INDEX IF NOT EXISTS idx_partidos_arbitro ON partidos(arbitro);
        "#,
    )
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TeamInput {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub league: Option<String>,
    pub country: Option<String>,
    pub stadium: Option<String>,
    pub founded: Option<u16>,
    pub coach: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlayerInput {
    pub name: Option<String>,
    pub team_id: Option<i64>,
    pub position: Option<String>,
    pub nationality: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub shirt_number: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatchInput {
    pub kickoff: Option<DateTime<Utc>>,
    pub league: Option<String>,
    pub home_team_id: Option<i64>,
    pub away_team_id: Option<i64>,
    pub home_goals: Option<u8>,
    pub away_goals: Option<u8>,
    pub status: Option<MatchStatus>,
    pub referee: Option<String>,
    pub venue: Option<String>,
    pub round: Option<String>,
}

fn required(field: &str, value: &Option<String>) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(HubError::validation(field, "required")),
    }
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn league_code(value: &Option<String>) -> Result<Option<String>> {
    match optional(value) {
        None => Ok(None),
        Some(raw) => League::from_code(&raw)
            .map(|l| Some(l.code().to_string()))
            .ok_or_else(|| HubError::validation("league", format!("unknown league {raw:?}"))),
    }
}

struct ValidTeam {
    name: String,
    short_name: Option<String>,
    league: Option<String>,
    country: Option<String>,
    stadium: Option<String>,
    founded: Option<u16>,
    coach: Option<String>,
}

impl TeamInput {
    fn validate(&self) -> Result<ValidTeam> {
        let name = required("name", &self.name)?;
        if let Some(year) = self.founded {
            let this_year = Utc::now().year();
            if !(1850..=this_year).contains(&i32::from(year)) {
                return Err(HubError::validation(
                    "founded",
                    format!("{year} is outside 1850..={this_year}"),
                ));
            }
        }
        Ok(ValidTeam {
            name,
            short_name: optional(&self.short_name),
            league: league_code(&self.league)?,
            country: optional(&self.country),
            stadium: optional(&self.stadium),
            founded: self.founded,
            coach: optional(&self.coach),
        })
    }
}

struct ValidPlayer {
    name: String,
    team_id: Option<i64>,
    position: Option<String>,
    nationality: Option<String>,
    birth_date: Option<NaiveDate>,
    shirt_number: Option<u8>,
}

impl PlayerInput {
    fn validate(&self) -> Result<ValidPlayer> {
        let name = required("name", &self.name)?;
        if let Some(n) = self.shirt_number
            && !(1..=99).contains(&n)
        {
            return Err(HubError::validation("shirt_number", "must be 1..=99"));
        }
        if let Some(born) = self.birth_date
            && born > Utc::now().date_naive()
        {
            return Err(HubError::validation("birth_date", "is in the future"));
        }
        Ok(ValidPlayer {
            name,
            team_id: self.team_id,
            position: optional(&self.position),
            nationality: optional(&self.nationality),
            birth_date: self.birth_date,
            shirt_number: self.shirt_number,
        })
    }
}

struct ValidMatch {
    kickoff: DateTime<Utc>,
    league: Option<String>,
    home_team_id: i64,
    away_team_id: i64,
    home_goals: Option<u8>,
    away_goals: Option<u8>,
    status: MatchStatus,
    referee: Option<String>,
    venue: Option<String>,
    round: Option<String>,
}

impl MatchInput {
    fn validate(&self) -> Result<ValidMatch> {
        let kickoff = self
            .kickoff
            .ok_or_else(|| HubError::validation("kickoff", "required"))?;
        let home_team_id = self
            .home_team_id
            .ok_or_else(|| HubError::validation("home_team_id", "required"))?;
        let away_team_id = self
            .away_team_id
            .ok_or_else(|| HubError::validation("away_team_id", "required"))?;
        if home_team_id == away_team_id {
            return Err(HubError::validation(
                "away_team_id",
                "a team cannot play itself",
            ));
        }
        if self.home_goals.is_some() != self.away_goals.is_some() {
            return Err(HubError::validation("goals", "set both sides or neither"));
        }
        Ok(ValidMatch {
            kickoff,
            league: league_code(&self.league)?,
            home_team_id,
            away_team_id,
            home_goals: self.home_goals,
            away_goals: self.away_goals,
            status: self.status.unwrap_or(MatchStatus::Scheduled),
            referee: optional(&self.referee),
            venue: optional(&self.venue),
            round: optional(&self.round),
        })
    }
}

/// Result of a read-only explorer query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExploreResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub truncated: bool,
}

/// Parses a store id; anything that is not a positive integer is not ours.
pub fn manual_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

const TEAM_COLUMNS: &str = "id, nombre, nombre_corto, liga, pais, estadio, fundado, entrenador";
const PLAYER_SELECT: &str = "SELECT j.id, j.nombre, j.equipo_id, e.nombre, j.posicion, \
     j.nacionalidad, j.fecha_nacimiento, j.dorsal \
     FROM jugadores j LEFT JOIN equipos e ON e.id = j.equipo_id";
const MATCH_COLUMNS: &str = "id, fecha, liga, equipo_local_id, equipo_visitante_id, \
     local_nombre, visitante_nombre, goles_local, goles_visitante, estado, arbitro, estadio, jornada";

fn stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn team_from_row(row: &Row<'_>) -> rusqlite::Result<Team> {
    let id: i64 = row.get(0)?;
    let mut team = Team::new(MANUAL_SOURCE, id.to_string(), row.get::<_, String>(1)?);
    team.short_name = row.get(2)?;
    team.league = row.get(3)?;
    team.country = row.get(4)?;
    team.stadium = row.get(5)?;
    team.founded = row.get(6)?;
    team.coach = row.get(7)?;
    Ok(team)
}

fn player_from_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    let id: i64 = row.get(0)?;
    let mut player = Player::new(MANUAL_SOURCE, id.to_string(), row.get::<_, String>(1)?);
    player.team_id = row.get::<_, Option<i64>>(2)?.map(|id| id.to_string());
    player.team_name = row.get(3)?;
    player.position = row.get(4)?;
    player.nationality = row.get(5)?;
    player.birth_date = row
        .get::<_, Option<String>>(6)?
        .and_then(|raw| NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok());
    player.shirt_number = row.get(7)?;
    Ok(player)
}

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<Match> {
    let id: i64 = row.get(0)?;
    let raw_kickoff: String = row.get(1)?;
    let kickoff = DateTime::parse_from_rfc3339(&raw_kickoff)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
        })?;
    let mut row_match = Match::new(
        MANUAL_SOURCE,
        id.to_string(),
        kickoff,
        row.get::<_, String>(5)?,
        row.get::<_, String>(6)?,
    );
    row_match.league = row.get(2)?;
    row_match.home_id = row.get::<_, Option<i64>>(3)?.map(|id| id.to_string());
    row_match.away_id = row.get::<_, Option<i64>>(4)?.map(|id| id.to_string());
    row_match.home_goals = row.get(7)?;
    row_match.away_goals = row.get(8)?;
    row_match.status = MatchStatus::parse(&row.get::<_, String>(9)?);
    row_match.referee = row.get(10)?;
    row_match.venue = row.get(11)?;
    row_match.round = row.get(12)?;
    Ok(row_match)
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    rows.collect()
}

/// CRUD over the manual tables. Cheap to clone; every call borrows one
/// pooled connection for its duration.
#[derive(Clone)]
pub struct Store {
    pool: Arc<ConnectionPool>,
}

impl Store {
    pub fn open(pool: Arc<ConnectionPool>) -> Result<Self> {
        {
            let mut conn = pool.acquire()?;
            conn.run(init_schema)?;
        }
        info!("store schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn create_team(&self, input: &TeamInput) -> Result<Team> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        let id = conn.run(|c| {
            c.execute(
                "INSERT INTO equipos(nombre, nombre_corto, liga, pais, estadio, fundado, entrenador, creado_en)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    v.name,
                    v.short_name,
                    v.league,
                    v.country,
                    v.stadium,
                    v.founded,
                    v.coach,
                    stamp(&Utc::now())
                ],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        debug!(id, name = %v.name, "team created");
        self.require_team(&mut conn, id)
    }

    pub fn update_team(&self, id: i64, input: &TeamInput) -> Result<Team> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        let changed = conn.run(|c| {
            let tx = c.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE equipos SET nombre = ?1, nombre_corto = ?2, liga = ?3, pais = ?4,
                 estadio = ?5, fundado = ?6, entrenador = ?7 WHERE id = ?8",
                params![
                    v.name,
                    v.short_name,
                    v.league,
                    v.country,
                    v.stadium,
                    v.founded,
                    v.coach,
                    id
                ],
            )?;
            if changed > 0 {
                // Keep the name snapshots on this team's matches in step.
                tx.execute(
                    "UPDATE partidos SET local_nombre = ?1 WHERE equipo_local_id = ?2",
                    params![v.name, id],
                )?;
                tx.execute(
                    "UPDATE partidos SET visitante_nombre = ?1 WHERE equipo_visitante_id = ?2",
                    params![v.name, id],
                )?;
            }
            tx.commit()?;
            Ok(changed)
        })?;
        if changed == 0 {
            return Err(HubError::not_found("team", id.to_string()));
        }
        self.require_team(&mut conn, id)
    }

    /// Deletes the team and returns it. Players and matches keep their rows
    /// with the reference cleared.
    pub fn delete_team(&self, id: i64) -> Result<Team> {
        let mut conn = self.pool.acquire()?;
        let team = self.require_team(&mut conn, id)?;
        conn.run(|c| c.execute("DELETE FROM equipos WHERE id = ?1", params![id]))?;
        debug!(id, "team deleted");
        Ok(team)
    }

    pub fn team(&self, id: i64) -> Result<Option<Team>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            c.query_row(
                &format!("SELECT {TEAM_COLUMNS} FROM equipos WHERE id = ?1"),
                params![id],
                team_from_row,
            )
            .optional()
        })
    }

    /// Manual teams, optionally restricted to one league code.
    pub fn teams(&self, league: Option<&str>) -> Result<Vec<Team>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| match league {
            Some(code) => collect(
                c,
                &format!("SELECT {TEAM_COLUMNS} FROM equipos WHERE liga = ?1 ORDER BY id"),
                params![code],
                team_from_row,
            ),
            None => collect(
                c,
                &format!("SELECT {TEAM_COLUMNS} FROM equipos ORDER BY id"),
                [],
                team_from_row,
            ),
        })
    }

    /// Manual teams matching an id or a normalized name.
    pub fn find_teams(&self, name_or_id: &str) -> Result<Vec<Team>> {
        if let Some(id) = manual_id(name_or_id) {
            return Ok(self.team(id)?.into_iter().collect());
        }
        Ok(self
            .teams(None)?
            .into_iter()
            .filter(|team| team.matches_ref(name_or_id))
            .collect())
    }

    pub fn create_player(&self, input: &PlayerInput) -> Result<Player> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        if let Some(team_id) = v.team_id {
            self.require_team_ref(&mut conn, team_id)?;
        }
        let id = conn.run(|c| {
            c.execute(
                "INSERT INTO jugadores(nombre, equipo_id, posicion, nacionalidad, fecha_nacimiento, dorsal, creado_en)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    v.name,
                    v.team_id,
                    v.position,
                    v.nationality,
                    v.birth_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    v.shirt_number,
                    stamp(&Utc::now())
                ],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        debug!(id, name = %v.name, "player created");
        self.require_player(&mut conn, id)
    }

    pub fn update_player(&self, id: i64, input: &PlayerInput) -> Result<Player> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        if let Some(team_id) = v.team_id {
            self.require_team_ref(&mut conn, team_id)?;
        }
        let changed = conn.run(|c| {
            c.execute(
                "UPDATE jugadores SET nombre = ?1, equipo_id = ?2, posicion = ?3, nacionalidad = ?4,
                 fecha_nacimiento = ?5, dorsal = ?6 WHERE id = ?7",
                params![
                    v.name,
                    v.team_id,
                    v.position,
                    v.nationality,
                    v.birth_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    v.shirt_number,
                    id
                ],
            )
        })?;
        if changed == 0 {
            return Err(HubError::not_found("player", id.to_string()));
        }
        self.require_player(&mut conn, id)
    }

    pub fn delete_player(&self, id: i64) -> Result<Player> {
        let mut conn = self.pool.acquire()?;
        let player = self.require_player(&mut conn, id)?;
        conn.run(|c| c.execute("DELETE FROM jugadores WHERE id = ?1", params![id]))?;
        debug!(id, "player deleted");
        Ok(player)
    }

    pub fn player(&self, id: i64) -> Result<Option<Player>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            c.query_row(
                &format!("{PLAYER_SELECT} WHERE j.id = ?1"),
                params![id],
                player_from_row,
            )
            .optional()
        })
    }

    pub fn players_of_team(&self, team_id: i64) -> Result<Vec<Player>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            collect(
                c,
                &format!("{PLAYER_SELECT} WHERE j.equipo_id = ?1 ORDER BY j.id"),
                params![team_id],
                player_from_row,
            )
        })
    }

    pub fn create_match(&self, input: &MatchInput) -> Result<Match> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        let home = self.require_team_ref(&mut conn, v.home_team_id)?;
        let away = self.require_team_ref(&mut conn, v.away_team_id)?;
        let id = conn.run(|c| {
            c.execute(
                "INSERT INTO partidos(fecha, liga, equipo_local_id, equipo_visitante_id, local_nombre,
                 visitante_nombre, goles_local, goles_visitante, estado, arbitro, estadio, jornada, creado_en)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    stamp(&v.kickoff),
                    v.league.clone().or(home.league.clone()),
                    v.home_team_id,
                    v.away_team_id,
                    home.name,
                    away.name,
                    v.home_goals,
                    v.away_goals,
                    v.status.as_str(),
                    v.referee,
                    v.venue.clone().or(home.stadium.clone()),
                    v.round,
                    stamp(&Utc::now())
                ],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        debug!(id, home = %home.name, away = %away.name, "match created");
        self.require_match(&mut conn, id)
    }

    pub fn update_match(&self, id: i64, input: &MatchInput) -> Result<Match> {
        let v = input.validate()?;
        let mut conn = self.pool.acquire()?;
        let home = self.require_team_ref(&mut conn, v.home_team_id)?;
        let away = self.require_team_ref(&mut conn, v.away_team_id)?;
        let changed = conn.run(|c| {
            c.execute(
                "UPDATE partidos SET fecha = ?1, liga = ?2, equipo_local_id = ?3, equipo_visitante_id = ?4,
                 local_nombre = ?5, visitante_nombre = ?6, goles_local = ?7, goles_visitante = ?8,
                 estado = ?9, arbitro = ?10, estadio = ?11, jornada = ?12 WHERE id = ?13",
                params![
                    stamp(&v.kickoff),
                    v.league.clone().or(home.league.clone()),
                    v.home_team_id,
                    v.away_team_id,
                    home.name,
                    away.name,
                    v.home_goals,
                    v.away_goals,
                    v.status.as_str(),
                    v.referee,
                    v.venue.clone().or(home.stadium.clone()),
                    v.round,
                    id
                ],
            )
        })?;
        if changed == 0 {
            return Err(HubError::not_found("match", id.to_string()));
        }
        self.require_match(&mut conn, id)
    }

    pub fn delete_match(&self, id: i64) -> Result<Match> {
        let mut conn = self.pool.acquire()?;
        let row = self.require_match(&mut conn, id)?;
        conn.run(|c| c.execute("DELETE FROM partidos WHERE id = ?1", params![id]))?;
        debug!(id, "match deleted");
        Ok(row)
    }

    pub fn match_by_id(&self, id: i64) -> Result<Option<Match>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            c.query_row(
                &format!("SELECT {MATCH_COLUMNS} FROM partidos WHERE id = ?1"),
                params![id],
                match_from_row,
            )
            .optional()
        })
    }

    /// Manual matches with kickoff in `[from, to)`, optionally for one league.
    pub fn matches_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        league: Option<&str>,
    ) -> Result<Vec<Match>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            collect(
                c,
                &format!(
                    "SELECT {MATCH_COLUMNS} FROM partidos
                     WHERE fecha >= ?1 AND fecha < ?2 AND (?3 IS NULL OR liga = ?3)
                     ORDER BY fecha, id"
                ),
                params![stamp(&from), stamp(&to), league],
                match_from_row,
            )
        })
    }

    /// Manual matches with a referee recorded, most recent first.
    pub fn refereed_matches(&self) -> Result<Vec<Match>> {
        let mut conn = self.pool.acquire()?;
        conn.run(|c| {
            collect(
                c,
                &format!(
                    "SELECT {MATCH_COLUMNS} FROM partidos
                     WHERE arbitro IS NOT NULL AND arbitro <> '' ORDER BY fecha DESC, id"
                ),
                [],
                match_from_row,
            )
        })
    }

    /// Runs one read-only statement and returns its rows as text.
    pub fn explore(&self, sql: &str) -> Result<ExploreResult> {
        let sql = check_explorer_sql(sql)?;
        let mut conn = self.pool.acquire()?;
        let outcome = conn.run(|c| {
            let mut stmt = c.prepare(sql)?;
            if !stmt.readonly() {
                return Ok(None);
            }
            let columns: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
            let width = columns.len();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            let mut truncated = false;
            while let Some(row) = rows.next()? {
                if out.len() == EXPLORE_MAX_ROWS {
                    truncated = true;
                    break;
                }
                let mut cells = Vec::with_capacity(width);
                for idx in 0..width {
                    cells.push(render_cell(row.get_ref(idx)?));
                }
                out.push(cells);
            }
            Ok(Some(ExploreResult {
                columns,
                rows: out,
                truncated,
            }))
        })?;
        outcome.ok_or_else(|| denied("statement is not read-only"))
    }

    fn require_team(&self, conn: &mut PooledConnection<'_>, id: i64) -> Result<Team> {
        conn.run(|c| {
            c.query_row(
                &format!("SELECT {TEAM_COLUMNS} FROM equipos WHERE id = ?1"),
                params![id],
                team_from_row,
            )
            .optional()
        })?
        .ok_or_else(|| HubError::not_found("team", id.to_string()))
    }

    /// A team referenced from another record; a missing one is a caller error.
    fn require_team_ref(
        &self,
        conn: &mut PooledConnection<'_>,
        id: i64,
    ) -> Result<Team> {
        self.require_team(conn, id).map_err(|err| match err {
            HubError::NotFound { .. } => {
                HubError::validation("team_id", format!("team {id} does not exist"))
            }
            other => other,
        })
    }

    fn require_player(
        &self,
        conn: &mut PooledConnection<'_>,
        id: i64,
    ) -> Result<Player> {
        conn.run(|c| {
            c.query_row(
                &format!("{PLAYER_SELECT} WHERE j.id = ?1"),
                params![id],
                player_from_row,
            )
            .optional()
        })?
        .ok_or_else(|| HubError::not_found("player", id.to_string()))
    }

    fn require_match(
        &self,
        conn: &mut PooledConnection<'_>,
        id: i64,
    ) -> Result<Match> {
        conn.run(|c| {
            c.query_row(
                &format!("SELECT {MATCH_COLUMNS} FROM partidos WHERE id = ?1"),
                params![id],
                match_from_row,
            )
            .optional()
        })?
        .ok_or_else(|| HubError::not_found("match", id.to_string()))
    }
}

/// Rejects anything but a single SELECT/WITH statement free of write keywords.
pub fn check_explorer_sql(sql: &str) -> Result<&str> {
    let mut trimmed = sql.trim();
    if let Some(end) = statement_end(trimmed) {
        if !trimmed[end..].chars().all(|c| c == ';' || c.is_whitespace()) {
            return Err(denied("only one statement is allowed"));
        }
        trimmed = trimmed[..end].trim();
    }
    if trimmed.is_empty() {
        return Err(denied("empty query"));
    }
    if let Some(m) = WRITE_KEYWORDS.find(trimmed) {
        return Err(HubError::ExplorerDenied {
            reason: format!("keyword {} is not allowed", m.as_str().to_ascii_uppercase()),
        });
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first != "SELECT" && first != "WITH" {
        return Err(denied("query must start with SELECT or WITH"));
    }
    Ok(trimmed)
}

/// Byte offset of the first `;` outside string literals, quoted identifiers
/// and comments.
fn statement_end(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let skip_to = |from: usize, pattern: &str| {
        sql[from..]
            .find(pattern)
            .map_or(bytes.len(), |at| from + at + pattern.len())
    };
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote simply opens the next literal.
            quote @ (b'\'' | b'"' | b'`') => {
                i = skip_to(i + 1, &char::from(quote).to_string());
            }
            b'[' => i = skip_to(i + 1, "]"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_to(i + 2, "\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_to(i + 2, "*/"),
            b';' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn denied(reason: &str) -> HubError {
    HubError::ExplorerDenied {
        reason: reason.to_string(),
    }
}

fn render_cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<blob {} bytes>", b.len()),
    }
}
