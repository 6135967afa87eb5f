#![cfg(not(tarpaulin_include))]

use chrono::Utc;
use glucolog::archive;
use glucolog::config::Config;
use glucolog::error::StoreError;
use glucolog::export;
use glucolog::saving::{self, UserBackup};
use glucolog::store::Database;
use std::env;
use std::error::Error;
use std::process::ExitCode;

const USAGE: &str = "Usage: glucolog-admin <command>

Commands:
  users                      list accounts
  archive                    roll weekly/monthly stats of every account over
  refresh <user>             recompute the stats of one account
  export <user> [file]       write readings as CSV (stdout without a file)
  backup <user> <file>       write a compressed backup of one account
  restore <user> <file>      replace readings and stats from a backup";

fn existing_user(db: &Database, username: &str) -> Result<glucolog::auth::User, StoreError> {
    db.user(username)?
        .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
}

fn run(db: &Database, args: &[String]) -> Result<(), Box<dyn Error>> {
    let now = Utc::now();

    match args {
        [cmd] if cmd == "users" => {
            for name in db.usernames()? {
                let user = existing_user(db, &name)?;
                println!(
                    "{:<24} {:<32} {:<10} {} readings",
                    user.username,
                    user.email,
                    if user.verified { "verified" } else { "pending" },
                    db.readings(&name)?.len()
                );
            }
        }
        [cmd] if cmd == "archive" => {
            let run = archive::archive_all(db, now)?;
            println!(
                "{} accounts, {} weekly and {} monthly rollovers, {} failed",
                run.users, run.weekly_rolled, run.monthly_rolled, run.failed
            );
        }
        [cmd, user] if cmd == "refresh" => {
            let profile = existing_user(db, user)?.profile;
            let stats = archive::refresh_user(db, user, now)?;
            for stat in stats.summary(profile.unit) {
                let value = stat
                    .current
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<32} {}", stat.label, value);
            }
        }
        [cmd, user, rest @ ..] if cmd == "export" && rest.len() <= 1 => {
            let profile = existing_user(db, user)?.profile;
            let csv = export::to_csv(&db.readings(user)?, profile.unit);
            match rest.first() {
                Some(file) => {
                    std::fs::write(file, csv)?;
                    log::info!("Exported readings of {} to {}", user, file);
                }
                None => print!("{}", csv),
            }
        }
        [cmd, user, file] if cmd == "backup" => {
            let profile = existing_user(db, user)?.profile;
            let backup = UserBackup::new(user, profile, db.readings(user)?, db.stats(user)?);
            saving::save_backup_file(&backup, file)?;
            println!("Wrote {} readings to {}", backup.readings.len(), file);
        }
        [cmd, user, file] if cmd == "restore" => {
            existing_user(db, user)?;
            let backup = saving::load_backup_file(file)?;
            let restored = backup.readings.len();
            db.update_readings(user, |readings| {
                *readings = backup.readings;
                Ok::<_, StoreError>(())
            })?;
            db.save_stats(user, &backup.stats)?;
            archive::refresh_user(db, user, now)?;
            println!("Restored {} readings to {}", restored, user);
        }
        _ => {
            eprintln!("{}", USAGE);
            return Err("unknown command".into());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let result = Config::load()
        .map_err(Box::<dyn Error>::from)
        .and_then(|config| Ok(Database::open(&config.data_dir)?))
        .and_then(|db| run(&db, &args));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
