//! Write context shared by the engine's components.

use crate::sequence::Sequencer;
use crate::subscriptions::EngineEvent;
use crate::types::Timestamp;
use rusqlite::Connection;

/// One unit of work against the database.
///
/// The connection is inside an open SQLite transaction for the lifetime of
/// the session; events are only broadcast once that transaction commits.
pub(crate) struct Session<'a> {
    pub conn: &'a Connection,
    pub sequencer: &'a mut Sequencer,
    pub events: Vec<EngineEvent>,
}

impl<'a> Session<'a> {
    pub fn new(conn: &'a Connection, sequencer: &'a mut Sequencer) -> Self {
        Self {
            conn,
            sequencer,
            events: Vec::new(),
        }
    }

    pub fn next_id(&mut self) -> String {
        self.sequencer.next_id()
    }

    pub fn now(&mut self) -> Timestamp {
        self.sequencer.next_timestamp()
    }

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}
