use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;

use matchday_hub::leagues::League;
use matchday_hub::{Aggregator, HubConfig, logging};

const USAGE: &str = "usage: matchday [--verbose] [--db=PATH] [--cache-dir=DIR] [--timeout=SECS] <command>

commands:
  upcoming [--days N] [--league L]   matches from today through N days (default 7)
  teams <league>                     teams of a league (PL, PD, BL1, SA, FL1, CL)
  team <name|id>                     one team, merged across sources
  players <team>                     squad of a team
  standings <league>                 league table
  referee <name> [--team T]          recent matches handled by a referee
  explore <sql>                      read-only query against the local store
  invalidate <namespace>             drop cached views (team, teams, players, upcoming, standings, referees)
  stats                              cache and pool counters";

struct Cli {
    verbose: bool,
    db: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = parse_cli(std::env::args().skip(1).collect())?;
    if let Err(err) = logging::init_tracing(cli.verbose) {
        eprintln!("tracing already initialized: {err}");
    }

    let mut config = HubConfig::from_env();
    if let Some(db) = cli.db.clone() {
        config.pool.db_path = db;
    }
    if let Some(dir) = cli.cache_dir.clone() {
        config.cache.dir = dir;
    }

    let mut hub = Aggregator::from_config(&config).context("failed to start aggregator")?;
    if let Some(timeout) = cli.timeout {
        hub = hub.with_deadline(timeout);
    }
    let result = run(&hub, &cli.command);
    hub.close();
    result
}

fn run(hub: &Aggregator, command: &[String]) -> Result<()> {
    let Some((name, rest)) = command.split_first() else {
        bail!("missing command\n\n{USAGE}");
    };
    match name.as_str() {
        "upcoming" => {
            let days = flag_value(rest, "--days")
                .map(|raw| raw.parse::<u32>().context("--days must be a number"))
                .transpose()?
                .unwrap_or(7);
            let league = flag_value(rest, "--league").map(parse_league).transpose()?;
            print_json(&hub.get_upcoming_matches(days, league)?)
        }
        "teams" => {
            let league = parse_league(positional(rest, "league")?)?;
            print_json(&hub.get_teams(league)?)
        }
        "team" => print_json(&hub.get_team(&positional_tail(rest, "team")?)?),
        "players" => print_json(&hub.get_players_of_team(&positional_tail(rest, "team")?)?),
        "standings" => {
            let league = parse_league(positional(rest, "league")?)?;
            print_json(&hub.get_standings(league)?)
        }
        "referee" => {
            let team = flag_value(rest, "--team");
            let name = positional_tail(&strip_flag(rest, "--team"), "referee name")?;
            print_json(&hub.get_referee_history(&name, team)?)
        }
        "explore" => print_json(&hub.explore(&positional_tail(rest, "sql")?)?),
        "invalidate" => {
            let namespace = positional(rest, "namespace")?;
            hub.invalidate(namespace);
            print_json(&serde_json::json!({ "invalidated": namespace }))
        }
        "stats" => print_json(&hub.stats()),
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        other => Err(anyhow!("unknown command {other:?}\n\n{USAGE}")),
    }
}

fn parse_cli(args: Vec<String>) -> Result<Cli> {
    let mut cli = Cli {
        verbose: false,
        db: None,
        cache_dir: None,
        timeout: None,
        command: Vec::new(),
    };
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        // Global flags only before the command name.
        if !cli.command.is_empty() {
            cli.command.push(arg);
            continue;
        }
        if arg == "--verbose" || arg == "-v" {
            cli.verbose = true;
        } else if let Some(path) = arg.strip_prefix("--db=") {
            cli.db = non_blank(path).map(PathBuf::from);
        } else if arg == "--db" {
            cli.db = iter.next().as_deref().and_then(non_blank).map(PathBuf::from);
        } else if let Some(dir) = arg.strip_prefix("--cache-dir=") {
            cli.cache_dir = non_blank(dir).map(PathBuf::from);
        } else if arg == "--cache-dir" {
            cli.cache_dir = iter.next().as_deref().and_then(non_blank).map(PathBuf::from);
        } else if let Some(raw) = arg.strip_prefix("--timeout=") {
            cli.timeout = Some(parse_secs(raw)?);
        } else if arg == "--timeout" {
            let raw = iter.next().context("--timeout needs a value")?;
            cli.timeout = Some(parse_secs(&raw)?);
        } else {
            cli.command.push(arg);
        }
    }
    Ok(cli)
}

fn parse_secs(raw: &str) -> Result<Duration> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid timeout {raw:?}"))?;
    Ok(Duration::from_secs(secs.max(1)))
}

fn non_blank(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_league(raw: &str) -> Result<League> {
    League::from_code(raw).ok_or_else(|| anyhow!("unknown league {raw:?}"))
}

/// Value of `--name V` or `--name=V`.
fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(name).and_then(|v| v.strip_prefix('=')) {
            return non_blank(value);
        }
        if arg == name {
            return args.get(idx + 1).map(String::as_str).and_then(non_blank);
        }
    }
    None
}

fn strip_flag(args: &[String], name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == name {
            skip_next = true;
            continue;
        }
        if arg.starts_with(&format!("{name}=")) {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn positional<'a>(args: &'a [String], what: &str) -> Result<&'a str> {
    args.iter()
        .find(|a| !a.starts_with("--"))
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing {what}\n\n{USAGE}"))
}

/// Remaining words joined, so `team Real Madrid` works without quotes.
fn positional_tail(args: &[String], what: &str) -> Result<String> {
    let joined = args.join(" ");
    non_blank(&joined)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing {what}\n\n{USAGE}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}
