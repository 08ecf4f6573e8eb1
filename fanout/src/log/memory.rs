use std::sync::{Arc, Mutex, MutexGuard};

use crate::bail;
use crate::error::{ErrorKind, FanoutResult};
use crate::log::LogReader;
use crate::types::{Seqno, TransactionEvent};

/// In-memory transaction log for tests and development.
///
/// [`MemoryLog`] keeps every appended fragment and hands out readers positioned at any
/// sequence number, which is how a restarted pipeline replays the log from its restart
/// position. Cloning is cheap and every clone shares the same content.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    events: Arc<Mutex<Vec<TransactionEvent>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log holding `events`, which must already be in log order.
    pub fn from_events(events: impl IntoIterator<Item = TransactionEvent>) -> FanoutResult<Self> {
        let log = Self::new();
        for event in events {
            log.append(event)?;
        }

        Ok(log)
    }

    /// Appends a fragment.
    ///
    /// Fails with [`ErrorKind::OrderingViolation`] if the fragment does not continue the log.
    pub fn append(&self, event: TransactionEvent) -> FanoutResult<()> {
        let mut events = self.events();
        if let Some(last) = events.last() {
            let continues = if last.last_frag {
                event.fragno == 0 && event.seqno > last.seqno
            } else {
                event.seqno == last.seqno && event.fragno == last.fragno + 1
            };

            if !continues {
                bail!(
                    ErrorKind::OrderingViolation,
                    "Appended fragment does not continue the log",
                    format!(
                        "seqno {} fragment {} after seqno {} fragment {}",
                        event.seqno, event.fragno, last.seqno, last.fragno
                    )
                );
            }
        }

        events.push(event);

        Ok(())
    }

    /// Returns a reader starting at the first transaction with a sequence number of at least
    /// `seqno`.
    pub fn reader_from(&self, seqno: Seqno) -> MemoryLogReader {
        MemoryLogReader {
            log: self.clone(),
            start_seqno: seqno,
            position: None,
        }
    }

    /// Returns a reader starting at the beginning of the log.
    pub fn reader(&self) -> MemoryLogReader {
        self.reader_from(0)
    }

    /// Number of fragments in the log.
    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    fn events(&self) -> MutexGuard<'_, Vec<TransactionEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reader over a [`MemoryLog`].
#[derive(Debug, Clone)]
pub struct MemoryLogReader {
    log: MemoryLog,
    start_seqno: Seqno,
    position: Option<usize>,
}

impl MemoryLogReader {
    fn read(&mut self) -> Option<TransactionEvent> {
        let events = self.log.events();
        let position = match self.position {
            Some(position) => position,
            None => {
                // Resolved lazily so a reader created ahead of the appends still finds its start.
                let start = events
                    .iter()
                    .position(|event| event.seqno >= self.start_seqno && event.is_first_fragment())?;
                self.position = Some(start);
                start
            }
        };

        let event = events.get(position).cloned()?;
        self.position = Some(position + 1);

        Some(event)
    }
}

impl LogReader for MemoryLogReader {
    async fn next_event(&mut self) -> FanoutResult<Option<TransactionEvent>> {
        Ok(self.read())
    }
}
