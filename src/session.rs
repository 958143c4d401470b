//! Decode session: running totals and an optional audit trail across tracks.
//!
//! A session is shared between decoders behind an `Arc` and may be updated
//! from several tracks at once.  Audit entries are only kept when the session
//! was opened with auditing on; the totals are always kept.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::TrackResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub tracks_processed:  usize,
    pub sectors_decoded:   usize,
    /// Sectors that only verified after correction.
    pub sectors_recovered: usize,
    pub weak_bits_found:   usize,
    /// Bits changed by the corrector across all sectors.
    pub total_corrections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub message:   String,
}

#[derive(Debug)]
pub struct DecodeSession {
    id:      Uuid,
    started: DateTime<Utc>,
    audit:   bool,
    stats:   Mutex<SessionStats>,
    entries: Mutex<Vec<AuditEntry>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DecodeSession {
    pub fn new(audit: bool) -> Self {
        let session = Self {
            id:      Uuid::new_v4(),
            started: Utc::now(),
            audit,
            stats:   Mutex::new(SessionStats::default()),
            entries: Mutex::new(Vec::new()),
        };
        session.log(format!("session {} started", session.id));
        session
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn started(&self) -> DateTime<Utc> { self.started }
    pub fn audit_enabled(&self) -> bool { self.audit }

    pub fn stats(&self) -> SessionStats {
        lock(&self.stats).clone()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }

    /// Append an audit entry.  A no-op when auditing is off.
    pub fn log(&self, message: impl Into<String>) {
        if self.audit {
            lock(&self.entries).push(AuditEntry { timestamp: Utc::now(), message: message.into() });
        }
    }

    /// Fold one finished track into the totals.
    pub fn record_track(&self, track: &TrackResult) {
        {
            let mut s = lock(&self.stats);
            s.tracks_processed  += 1;
            s.sectors_decoded   += track.summary.sector_count;
            s.sectors_recovered += track.summary.corrected_count;
            s.weak_bits_found   += track.summary.weak_bits;
            s.total_corrections += track.sectors.iter().map(|r| r.corrections_count).sum::<usize>();
        }
        if !self.audit {
            return;
        }
        self.log(format!(
            "track {}.{} {}: {} digest={}",
            track.cylinder, track.head, track.encoding, track.summary, track.digest
        ));
        for r in track.sectors.iter().filter(|r| r.corrected) {
            self.log(format!("  {} corrected, {} bit(s) changed", r.id, r.corrections_count));
        }
        for r in track.sectors.iter() {
            if let Some(fault) = &r.fault {
                self.log(format!("  {}: {fault}", r.id));
            }
        }
        for issue in &track.issues {
            self.log(format!("  {issue}"));
        }
    }

    /// Write the audit trail as text, one entry per line.
    pub fn export_audit(&self, path: &Path) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "# session {} started {}", self.id, self.started.to_rfc3339())?;
        let stats = self.stats();
        writeln!(
            w,
            "# tracks={} sectors={} recovered={} weak_bits={} corrections={}",
            stats.tracks_processed,
            stats.sectors_decoded,
            stats.sectors_recovered,
            stats.weak_bits_found,
            stats.total_corrections,
        )?;
        for e in lock(&self.entries).iter() {
            writeln!(w, "{} {}", e.timestamp.to_rfc3339(), e.message)?;
        }
        w.flush()
    }
}
