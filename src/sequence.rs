//! Id and timestamp generation.
//!
//! Ids are the first 32 hex characters of `sha256("{seed}:{counter}")`. The
//! seed is derived once per session:
//!
//! - deterministic mode with an explicit seed: that seed;
//! - deterministic mode without one: the installation id (`lix_id`), which in
//!   deterministic mode is itself a fixed digest, so fresh engines replay the
//!   same ids;
//! - otherwise: a digest of the installation id, the wall clock and the
//!   process id, so two processes forked from one snapshot never collide.
//!
//! The counter and last timestamp are written to the key-value table on every
//! write transaction and travel inside exported snapshots, so a restored
//! engine continues the sequence instead of restarting it.

use crate::error::{EngineError, Result};
use crate::schema::KEY_VALUE_TABLE;
use crate::types::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const INSTALLATION_ID_KEY: &str = "lix_id";
const SEQUENCER_STATE_KEY: &str = "lix_sequencer_state";

/// First logical timestamp handed out in deterministic mode (2025-01-01).
const DETERMINISTIC_EPOCH_MICROS: i64 = 1_735_689_600_000_000;

/// Logical clock step in deterministic mode (1ms).
const DETERMINISTIC_STEP_MICROS: i64 = 1_000;

/// Configuration for reproducible ids and timestamps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeterministicConfig {
    /// Seed for id derivation; defaults to the installation id.
    pub seed: Option<String>,
}

/// Persisted generator state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerState {
    pub seed: String,
    pub counter: u64,
    pub last_timestamp: i64,
    pub deterministic: bool,
}

/// Session-scoped id/timestamp generator.
#[derive(Debug)]
pub struct Sequencer {
    state: SequencerState,
}

fn digest_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

impl Sequencer {
    /// Load the generator for a connection, initializing it on first use.
    ///
    /// A persisted state in deterministic mode is resumed as-is. In
    /// non-deterministic mode the counter and clock resume but the seed is
    /// re-derived for this session.
    pub fn load_or_init(conn: &Connection, deterministic: Option<&DeterministicConfig>) -> Result<Self> {
        let installation_id = Self::installation_id(conn, deterministic.is_some())?;
        let persisted = Self::read_state(conn)?;

        let state = match (persisted, deterministic) {
            (Some(state), Some(config))
                if state.deterministic && config.seed.as_ref().map_or(true, |seed| *seed == state.seed) =>
            {
                state
            }
            (persisted, Some(config)) => SequencerState {
                seed: config.seed.clone().unwrap_or_else(|| installation_id.clone()),
                counter: persisted.as_ref().map(|s| s.counter).unwrap_or(0),
                last_timestamp: persisted
                    .as_ref()
                    .map(|s| s.last_timestamp)
                    .unwrap_or(DETERMINISTIC_EPOCH_MICROS - DETERMINISTIC_STEP_MICROS),
                deterministic: true,
            },
            (persisted, None) => SequencerState {
                seed: digest_hex(&format!(
                    "{}:{}:{}",
                    installation_id,
                    Timestamp::now().0,
                    std::process::id()
                )),
                counter: persisted.as_ref().map(|s| s.counter).unwrap_or(0),
                last_timestamp: persisted.as_ref().map(|s| s.last_timestamp).unwrap_or(0),
                deterministic: false,
            },
        };

        let sequencer = Self { state };
        sequencer.persist(conn)?;
        Ok(sequencer)
    }

    fn installation_id(conn: &Connection, deterministic: bool) -> Result<String> {
        let existing: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {KEY_VALUE_TABLE} WHERE key = ?1"),
                params![INSTALLATION_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = if deterministic {
            digest_hex("lix-deterministic-installation")[..32].to_string()
        } else {
            let marker = 0u8;
            digest_hex(&format!(
                "{}:{}:{:p}",
                Timestamp::now().0,
                std::process::id(),
                &marker
            ))[..32]
                .to_string()
        };
        conn.execute(
            &format!("INSERT INTO {KEY_VALUE_TABLE} (key, value) VALUES (?1, ?2)"),
            params![INSTALLATION_ID_KEY, id],
        )?;
        Ok(id)
    }

    fn read_state(conn: &Connection) -> Result<Option<SequencerState>> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {KEY_VALUE_TABLE} WHERE key = ?1"),
                params![SEQUENCER_STATE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| EngineError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Write the generator state to the key-value table.
    pub fn persist(&self, conn: &Connection) -> Result<()> {
        let raw = serde_json::to_string(&self.state)?;
        conn.execute(
            &format!(
                "INSERT INTO {KEY_VALUE_TABLE} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            params![SEQUENCER_STATE_KEY, raw],
        )?;
        Ok(())
    }

    /// Next unique id.
    pub fn next_id(&mut self) -> String {
        self.state.counter += 1;
        digest_hex(&format!("{}:{}", self.state.seed, self.state.counter))[..32].to_string()
    }

    /// Next strictly increasing sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.state.counter += 1;
        self.state.counter
    }

    /// Next timestamp; strictly greater than every previous one.
    pub fn next_timestamp(&mut self) -> Timestamp {
        let next = if self.state.deterministic {
            self.state.last_timestamp + DETERMINISTIC_STEP_MICROS
        } else {
            Timestamp::now().0.max(self.state.last_timestamp + 1)
        };
        self.state.last_timestamp = next;
        Timestamp(next)
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn is_deterministic(&self) -> bool {
        self.state.deterministic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::migrate;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_deterministic_ids_repeat_across_fresh_engines() {
        let config = DeterministicConfig::default();
        let mut a = Sequencer::load_or_init(&conn(), Some(&config)).unwrap();
        let mut b = Sequencer::load_or_init(&conn(), Some(&config)).unwrap();
        assert_eq!(a.next_id(), b.next_id());
        assert_eq!(a.next_timestamp(), b.next_timestamp());
    }

    #[test]
    fn test_resume_continues_counter() {
        let conn = conn();
        let config = DeterministicConfig {
            seed: Some("seed".into()),
        };
        let mut first = Sequencer::load_or_init(&conn, Some(&config)).unwrap();
        let ids: Vec<String> = (0..3).map(|_| first.next_id()).collect();
        let ts = first.next_timestamp();
        first.persist(&conn).unwrap();

        let mut resumed = Sequencer::load_or_init(&conn, Some(&config)).unwrap();
        let next = resumed.next_id();
        assert!(!ids.contains(&next));
        assert!(resumed.next_timestamp() > ts);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut sequencer = Sequencer::load_or_init(&conn(), None).unwrap();
        let a = sequencer.next_timestamp();
        let b = sequencer.next_timestamp();
        assert!(b > a);
    }
}
