use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info};
use ulid::Ulid;

use salon_sched::closeout::day_bounds;
use salon_sched::config::Config;
use salon_sched::engine::{EngineError, Scheduler};
use salon_sched::model::MINUTE;
use salon_sched::observability;
use salon_sched::store::InMemoryStore;

const USAGE: &str = "\
usage: salon-sched <command>

commands:
  closeout <YYYY-MM-DD>                          close the day's open transactions
  agenda <therapist-ulid> <YYYY-MM-DD>           print the therapist's day
  free <therapist-ulid> <YYYY-MM-DD> [minutes]   print bookable gaps
  compact                                        rewrite the journal

environment:
  SALON_DATA_DIR, SALON_JOURNAL, SALON_UTC_OFFSET,
  SALON_METRICS_PORT, SALON_COMPACT_THRESHOLD";

enum Command {
    Closeout(NaiveDate),
    Agenda(Ulid, NaiveDate),
    Free(Ulid, NaiveDate, Option<i64>),
    Compact,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let arg = |i: usize, what: &str| {
        args.get(i)
            .map(String::as_str)
            .ok_or_else(|| format!("missing {what}"))
    };
    let date = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("bad date {s:?}: {e}"))
    };
    let therapist = |s: &str| Ulid::from_string(s).map_err(|e| format!("bad therapist id {s:?}: {e}"));

    match arg(0, "command")? {
        "closeout" => Ok(Command::Closeout(date(arg(1, "date")?)?)),
        "agenda" => Ok(Command::Agenda(
            therapist(arg(1, "therapist id")?)?,
            date(arg(2, "date")?)?,
        )),
        "free" => {
            let minutes: Option<i64> = match args.get(3) {
                Some(m) => Some(m.parse().map_err(|e| format!("bad minutes {m:?}: {e}"))?),
                None => None,
            };
            Ok(Command::Free(
                therapist(arg(1, "therapist id")?)?,
                date(arg(2, "date")?)?,
                minutes,
            ))
        }
        "compact" => Ok(Command::Compact),
        other => Err(format!("unknown command {other:?}")),
    }
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(
    command: Command,
    config: &Config,
    store: &Arc<InMemoryStore>,
    scheduler: &Scheduler,
) -> Result<(), Box<dyn std::error::Error>> {
    let tz = config.utc_offset;
    match command {
        Command::Closeout(date) => match scheduler.closeout(date, &tz).await {
            Ok(summary) => print_json(&summary)?,
            Err(EngineError::PartialCloseout(partial)) => {
                print_json(&partial)?;
                return Err(EngineError::PartialCloseout(partial).into());
            }
            Err(e) => return Err(e.into()),
        },
        Command::Agenda(therapist_id, date) => {
            let window = day_bounds(date, &tz)?;
            print_json(&scheduler.agenda(therapist_id, window).await?)?;
        }
        Command::Free(therapist_id, date, minutes) => {
            let window = day_bounds(date, &tz)?;
            let min_duration = minutes.map(|m| m * MINUTE);
            print_json(&scheduler.free_slots(therapist_id, window, min_duration).await?)?;
        }
        Command::Compact => {
            store.compact().await?;
            return Ok(());
        }
    }

    let appends = store.appends_since_compact().await;
    if appends >= config.compact_threshold {
        info!(appends, threshold = config.compact_threshold, "compacting journal");
        store.compact().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{msg}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = observability::init(config.metrics_port) {
        error!("metrics exporter: {e}");
    }

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(data_dir = %config.data_dir.display(), "cannot create data dir: {e}");
        return ExitCode::FAILURE;
    }
    let store = match InMemoryStore::open(&config.journal_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(journal = %config.journal_path().display(), "cannot open journal: {e}");
            return ExitCode::FAILURE;
        }
    };
    let scheduler = Scheduler::new(store.clone());

    match run(command, &config, &store, &scheduler).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
