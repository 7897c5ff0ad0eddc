use chrono::{DateTime, Utc};
use nuptial_core::{Error, Plan, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Durable per-session history entry. Consulted and appended exclusively by
/// the planner for its own session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SessionEvent {
    BeliefUpdate {
        key: String,
        value: serde_json::Value,
    },
    Decision {
        description: String,
    },
    TaskError {
        task_kind: String,
        detail: String,
        retry_count: u32,
    },
    PlanEmitted {
        plan: Plan,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum SessionLine {
    #[serde(rename = "metadata")]
    Metadata {
        session_id: String,
        created_at: String,
        updated_at: String,
    },
    #[serde(untagged)]
    Event {
        at: DateTime<Utc>,
        #[serde(flatten)]
        event: SessionEvent,
    },
}

/// Append-only per-session memory backed by one JSONL file per session.
/// Lifecycle: created on first user request, persists across turns, torn
/// down on explicit reset or TTL expiry.
pub struct SessionStore {
    dir: PathBuf,
    last_activity: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let store = Self {
            dir: dir.as_ref().to_path_buf(),
            last_activity: Mutex::new(HashMap::new()),
        };
        store.index_existing()?;
        Ok(store)
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    fn index_existing(&self) -> Result<()> {
        let mut index = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let modified: DateTime<Utc> = std::fs::metadata(&path)?
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                index.insert(stem.to_string(), modified);
            }
        }
        Ok(())
    }

    pub fn create(&self, session_id: &str) -> Result<()> {
        let path = self.session_file(session_id);
        if path.exists() {
            return Err(Error::Session(format!(
                "session {} already exists",
                session_id
            )));
        }
        let now = Utc::now().to_rfc3339();
        let mut file = File::create(&path)?;
        let metadata = SessionLine::Metadata {
            session_id: session_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        writeln!(file, "{}", serde_json::to_string(&metadata)?)?;
        self.touch(session_id);
        Ok(())
    }

    pub fn append(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        let path = self.session_file(session_id);
        if !path.exists() {
            return Err(Error::Session(format!("unknown session {}", session_id)));
        }
        let line = SessionLine::Event {
            at: Utc::now(),
            event,
        };
        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        self.touch(session_id);
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let path = self.session_file(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionLine>(&line) {
                Ok(SessionLine::Event { event, .. }) => events.push(event),
                Ok(SessionLine::Metadata { .. }) => {}
                Err(e) => debug!(error = %e, "Skipping unparseable session line"),
            }
        }
        Ok(events)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.session_file(session_id).exists()
    }

    /// Explicit reset: drop the session file and forget its activity.
    pub fn clear(&self, session_id: &str) -> Result<()> {
        let path = self.session_file(session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }

    /// Tear down sessions idle past the TTL. Returns the ids removed.
    pub fn expire(&self, ttl: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = {
            let index = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
            index
                .iter()
                .filter(|(_, at)| **at < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            debug!(session_id = %id, "Expiring idle session");
            self.clear(id)?;
        }
        Ok(expired)
    }

    fn touch(&self, session_id: &str) {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_append_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create("s1").unwrap();
        store
            .append(
                "s1",
                SessionEvent::BeliefUpdate {
                    key: "criteria".to_string(),
                    value: serde_json::json!({"presupuesto_total": 50000}),
                },
            )
            .unwrap();
        store
            .append(
                "s1",
                SessionEvent::TaskError {
                    task_kind: "find_venue".to_string(),
                    detail: "no candidate".to_string(),
                    retry_count: 1,
                },
            )
            .unwrap();

        let events = store.load("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::BeliefUpdate { .. }));
        assert!(matches!(events[1], SessionEvent::TaskError { .. }));
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create("s1").unwrap();
        assert!(matches!(store.create("s1"), Err(Error::Session(_))));
    }

    #[test]
    fn test_clear_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create("old").unwrap();
        store.create("fresh").unwrap();

        // Backdate "old" in the activity index.
        store
            .last_activity
            .lock()
            .unwrap()
            .insert("old".to_string(), Utc::now() - chrono::Duration::hours(48));

        let expired = store.expire(chrono::Duration::hours(24)).unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(!store.exists("old"));
        assert!(store.exists("fresh"));
    }
}
