use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ShareLock, utils};

/// Fixed-interval run trigger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub workflow_id: String,
    pub every: Duration,
    /// initial input of every run the schedule starts
    pub input: Value,
}

struct Entry {
    schedule: Schedule,
    next_due: i64,
}

#[derive(Clone, Default)]
pub(crate) struct Schedules {
    entries: ShareLock<Vec<Entry>>,
}

impl Schedules {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add(
        &self,
        workflow_id: &str,
        every: Duration,
        input: Value,
        now: i64,
    ) -> Schedule {
        let schedule = Schedule {
            id: utils::shortid(),
            workflow_id: workflow_id.to_string(),
            every,
            input,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.push(Entry {
                schedule: schedule.clone(),
                next_due: now.saturating_add(millis(every)),
            });
        }
        schedule
    }

    pub fn remove(
        &self,
        id: &str,
    ) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.schedule.id != id);
        entries.len() != before
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.entries.read().map(|entries| entries.iter().map(|e| e.schedule.clone()).collect()).unwrap_or_default()
    }

    /// Schedules due at `now`; each one is pushed to its next slot.
    pub fn due(
        &self,
        now: i64,
    ) -> Vec<Schedule> {
        let Ok(mut entries) = self.entries.write() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for entry in entries.iter_mut().filter(|e| e.next_due <= now) {
            // missed slots are not replayed
            let step = millis(entry.schedule.every).max(1);
            while entry.next_due <= now {
                entry.next_due = entry.next_due.saturating_add(step);
            }
            due.push(entry.schedule.clone());
        }
        due
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_due_fires_once_per_slot() {
        let schedules = Schedules::new();
        let s = schedules.add("wf", Duration::from_secs(10), json!({}), 0);

        assert!(schedules.due(9_999).is_empty());
        assert_eq!(schedules.due(10_000), vec![s.clone()]);
        assert!(schedules.due(10_000).is_empty());
        // a long pause fires a single run
        assert_eq!(schedules.due(55_000).len(), 1);
        assert!(schedules.due(59_999).is_empty());

        assert!(schedules.remove(&s.id));
        assert!(schedules.list().is_empty());
    }
}
