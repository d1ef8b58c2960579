//! Mining session context
//!
//! Holds everything the scheduler shares with the rest of the miner: the
//! current job template, the nonce counter, the closing flag and the time the
//! last graph was handed off. One context lives for one mining session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::siphash::{KeyDeriver, SipHashKeys};

/// Work received from the pool
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobTemplate {
    /// Block height
    pub height: u64,
    /// Pool job id
    pub id: u64,
    /// Header bytes hashed together with the nonce
    pub header: Vec<u8>,
}

/// Identity handed to the consumer with a trimmed graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    /// Block height
    pub height: u64,
    /// Pool job id
    pub id: u64,
    /// Nonce the keys were derived from
    pub nonce: u64,
}

/// One trimming job: identity plus the keys derived for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    /// Who the result belongs to
    pub identity: JobIdentity,
    /// SipHash keys of the graph
    pub keys: SipHashKeys,
}

/// Shared state of one mining session
#[derive(Debug)]
pub struct SessionContext {
    template: Mutex<JobTemplate>,
    nonce: AtomicU64,
    closing: AtomicBool,
    last_graph_processed: Mutex<Option<Instant>>,
}

impl SessionContext {
    /// Start a session on `template`, numbering jobs from `first_nonce`
    #[must_use]
    pub fn new(template: JobTemplate, first_nonce: u64) -> Self {
        Self {
            template: Mutex::new(template),
            nonce: AtomicU64::new(first_nonce),
            closing: AtomicBool::new(false),
            last_graph_processed: Mutex::new(None),
        }
    }

    /// Replace the job template; later jobs use it
    pub fn update_template(&self, template: JobTemplate) {
        *self.template.lock().unwrap_or_else(PoisonError::into_inner) = template;
    }

    /// Snapshot of the current template
    #[must_use]
    pub fn template(&self) -> JobTemplate {
        self.template
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consume a nonce and derive the next job's keys
    pub fn next_job(&self, deriver: &impl KeyDeriver) -> Job {
        let template = self.template.lock().unwrap_or_else(PoisonError::into_inner);
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        Job {
            identity: JobIdentity {
                height: template.height,
                id: template.id,
                nonce,
            },
            keys: deriver.derive_keys(&template.header, nonce),
        }
    }

    /// Nonce the next job will consume
    #[must_use]
    pub fn peek_nonce(&self) -> u64 {
        self.nonce.load(Ordering::Relaxed)
    }

    /// Ask the scheduler to stop at its next suspension point
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Whether the session is shutting down
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Record a graph hand-off and return the time since the previous one
    pub fn record_graph_processed(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut last = self
            .last_graph_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let since = last.map(|previous| now.duration_since(previous));
        *last = Some(now);
        since
    }
}
