use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Named session scope: one coordinator, an allow-list of participants.
#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub name: String,
    pub coordinator: String,
    pub allowed: BTreeSet<String>,
    pub joined: BTreeSet<String>,
    pub created_at: SystemTime,
}

impl Room {
    pub fn new(name: Option<String>, coordinator: impl Into<String>, roster: Vec<String>) -> Self {
        let name = name.unwrap_or_else(Self::generate_name);

        tracing::info!(room_name = %name, roster_size = roster.len(), "Room opened");

        Self {
            name,
            coordinator: coordinator.into(),
            allowed: roster.into_iter().collect(),
            joined: BTreeSet::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Generate a random room name
    pub fn generate_name() -> String {
        let mut rng = rand::thread_rng();
        format!("{:06}", rng.gen_range(100000..999999))
    }

    pub fn is_allowed(&self, identity: &str) -> bool {
        self.allowed.contains(identity)
    }

    /// Records a participant joining; `false` if the identity is not on the roster.
    pub fn admit(&mut self, identity: &str) -> bool {
        if !self.is_allowed(identity) {
            tracing::warn!(room_name = %self.name, identity = %identity, "Rejected join outside roster");
            return false;
        }

        if self.joined.insert(identity.to_string()) {
            tracing::info!(room_name = %self.name, identity = %identity, "Participant joined room");
        }
        true
    }

    pub fn allowed_identities(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }
}
