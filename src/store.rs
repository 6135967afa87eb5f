//! File-backed JSON database
//!
//! Layout under the data directory:
//!
//! ```text
//! users.json               all accounts, keyed by username
//! <username>/readings.json glucose readings of one user
//! <username>/stats.json    cached stats of one user
//! ```
//!
//! Accounts are cached in memory and written through on every change. Every
//! file is replaced atomically so a crash never leaves half-written JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::{self, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::auth::User;
use crate::error::StoreError;
use crate::reading::Reading;
use crate::stats::StatsRecord;

const USERS_FILE: &str = "users.json";
const READINGS_FILE: &str = "readings.json";
const STATS_FILE: &str = "stats.json";

pub struct Database {
    root: PathBuf,
    users: RwLock<HashMap<String, User>>,
    // held across every per-user read-modify-write
    files: Mutex<()>,
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(value)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

/// Rejects names that would escape the data directory
pub fn check_key(username: &str) -> Result<(), StoreError> {
    let valid = !username.is_empty()
        && !username.starts_with('.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(username.to_string()))
    }
}

impl Database {
    /// Opens (creating if needed) the database rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        create_dir_all(&root)?;

        let users_path = root.join(USERS_FILE);
        if !users_path.exists() {
            write_json(&users_path, &HashMap::<String, User>::new())?;
        }
        let users: HashMap<String, User> = read_json(&users_path)?;
        log::info!("Opened database at {} with {} users", root.display(), users.len());

        Ok(Self {
            root,
            users: RwLock::new(users),
            files: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, username: &str) -> Result<PathBuf, StoreError> {
        check_key(username)?;
        Ok(self.root.join(username))
    }

    fn save_users(&self, users: &HashMap<String, User>) -> Result<(), StoreError> {
        write_json(&self.root.join(USERS_FILE), users)
    }

    pub fn user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(|_| StoreError::Poisoned)?;
        Ok(users.get(username).cloned())
    }

    /// Looks an account up by email, ignoring case
    pub fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(|_| StoreError::Poisoned)?;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    pub fn usernames(&self) -> Result<Vec<String>, StoreError> {
        let users = self.users.read().map_err(|_| StoreError::Poisoned)?;
        let mut names: Vec<String> = users.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let dir = self.user_dir(&user.username)?;
        let mut users = self.users.write().map_err(|_| StoreError::Poisoned)?;

        if users.contains_key(&user.username) {
            return Err(StoreError::Duplicate("Username"));
        }
        if users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(StoreError::Duplicate("Email address"));
        }

        create_dir_all(dir)?;
        users.insert(user.username.clone(), user);
        if let Err(e) = self.save_users(&users) {
            // keep memory and disk in agreement
            let _ = self.reload_users(&mut users);
            return Err(e);
        }
        Ok(())
    }

    fn reload_users(&self, users: &mut HashMap<String, User>) -> Result<(), StoreError> {
        *users = read_json(&self.root.join(USERS_FILE))?;
        Ok(())
    }

    /// Mutates one account in place and persists the result
    pub fn update_user<R>(
        &self,
        username: &str,
        f: impl FnOnce(&mut User) -> R,
    ) -> Result<R, StoreError> {
        let mut users = self.users.write().map_err(|_| StoreError::Poisoned)?;
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        let result = f(user);
        if let Err(e) = self.save_users(&users) {
            let _ = self.reload_users(&mut users);
            return Err(e);
        }
        Ok(result)
    }

    /// Deletes an account together with all of its data
    pub fn remove_user(&self, username: &str) -> Result<(), StoreError> {
        let dir = self.user_dir(username)?;
        let mut users = self.users.write().map_err(|_| StoreError::Poisoned)?;
        if users.remove(username).is_none() {
            return Err(StoreError::UserNotFound(username.to_string()));
        }
        self.save_users(&users)?;

        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn readings(&self, username: &str) -> Result<Vec<Reading>, StoreError> {
        let path = self.user_dir(username)?.join(READINGS_FILE);
        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        read_json(&path)
    }

    pub fn save_readings(&self, username: &str, readings: &[Reading]) -> Result<(), StoreError> {
        let path = self.user_dir(username)?.join(READINGS_FILE);
        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        write_json(&path, readings)
    }

    /// Mutates a user's readings and persists them under one lock
    ///
    /// Nothing is written when `f` returns an error.
    pub fn update_readings<R, E>(
        &self,
        username: &str,
        f: impl FnOnce(&mut Vec<Reading>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let path = self.user_dir(username)?.join(READINGS_FILE);
        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        let mut readings: Vec<Reading> = read_json(&path)?;
        let result = f(&mut readings)?;
        write_json(&path, &readings)?;
        Ok(result)
    }

    pub fn stats(&self, username: &str) -> Result<StatsRecord, StoreError> {
        let path = self.user_dir(username)?.join(STATS_FILE);
        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        read_json(&path)
    }

    pub fn save_stats(&self, username: &str, stats: &StatsRecord) -> Result<(), StoreError> {
        let path = self.user_dir(username)?.join(STATS_FILE);
        let _guard = self.files.lock().map_err(|_| StoreError::Poisoned)?;
        write_json(&path, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Profile;
    use crate::reading::{GlucoseUnit, MealTiming, NewReading};
    use chrono::Utc;

    fn user(name: &str, email: &str) -> User {
        User {
            username: name.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            verified: true,
            created_at: Utc::now(),
            otp: None,
            profile: Profile::default(),
        }
    }

    #[test]
    fn users_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.insert_user(user("alice", "alice@example.com")).unwrap();
            db.update_user("alice", |u| u.profile.low_threshold = 80.0)
                .unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let alice = db.user("alice").unwrap().unwrap();
        assert_eq!(alice.profile.low_threshold, 80.0);
        assert_eq!(db.usernames().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn duplicate_username_or_email_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.insert_user(user("alice", "alice@example.com")).unwrap();

        assert!(matches!(
            db.insert_user(user("alice", "other@example.com")),
            Err(StoreError::Duplicate("Username"))
        ));
        assert!(matches!(
            db.insert_user(user("bob", "ALICE@example.com")),
            Err(StoreError::Duplicate("Email address"))
        ));
        assert!(db.user_by_email("Alice@Example.com").unwrap().is_some());
    }

    #[test]
    fn readings_and_stats_round_trip_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.insert_user(user("alice", "alice@example.com")).unwrap();

        assert!(db.readings("alice").unwrap().is_empty());
        assert_eq!(db.stats("alice").unwrap(), StatsRecord::default());

        let reading = crate::reading::Reading::create(
            NewReading {
                value: 105.0,
                unit: None,
                taken_at: None,
                meal: MealTiming::Fasting,
                note: Some("morning".to_string()),
            },
            GlucoseUnit::MgDl,
            Utc::now(),
        )
        .unwrap();
        db.save_readings("alice", std::slice::from_ref(&reading)).unwrap();
        assert_eq!(db.readings("alice").unwrap(), vec![reading]);
    }

    fn reading_at(minute: u32) -> Reading {
        Reading::create(
            NewReading {
                value: 100.0 + minute as f64,
                unit: None,
                taken_at: Some(Utc::now() - chrono::Duration::minutes(minute as i64)),
                meal: MealTiming::Other,
                note: None,
            },
            GlucoseUnit::MgDl,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn concurrent_reading_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.insert_user(user("alice", "alice@example.com")).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8u32 {
                let db = &db;
                scope.spawn(move || {
                    for i in 0..5u32 {
                        db.update_readings("alice", |readings| {
                            readings.push(reading_at(t * 5 + i));
                            Ok::<_, StoreError>(())
                        })
                        .unwrap();
                    }
                });
            }
        });

        assert_eq!(db.readings("alice").unwrap().len(), 40);
    }

    #[test]
    fn failed_reading_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.insert_user(user("alice", "alice@example.com")).unwrap();
        db.save_readings("alice", &[reading_at(1)]).unwrap();

        let result: Result<(), StoreError> = db.update_readings("alice", |readings| {
            readings.clear();
            Err(StoreError::UserNotFound("alice".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.readings("alice").unwrap().len(), 1);
    }

    #[test]
    fn path_traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert!(matches!(
            db.readings("../etc"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(check_key("a/b").is_err());
        assert!(check_key("bob.smith").is_ok());
    }

    #[test]
    fn remove_user_deletes_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.insert_user(user("alice", "alice@example.com")).unwrap();
        db.save_readings("alice", &[]).unwrap();

        db.remove_user("alice").unwrap();
        assert!(db.user("alice").unwrap().is_none());
        assert!(!dir.path().join("alice").exists());
        assert!(matches!(
            db.remove_user("alice"),
            Err(StoreError::UserNotFound(_))
        ));
    }
}
