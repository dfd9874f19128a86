//! Puffer für ICE Candidates, die vor der Remote Description ankommen

use super::connection::{IceCandidate, PeerConnection};
use std::collections::VecDeque;

/// FIFO für noch nicht anwendbare Discovery-Nachrichten.
///
/// Startet gesperrt. `drain_into` entsperrt die Queue und wendet alle
/// gepufferten Candidates in Empfangsreihenfolge an; danach gehen neue
/// Candidates direkt an die Verbindung.
#[derive(Debug)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    locked: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            locked: true,
        }
    }

    /// `true` solange die Remote Description noch nicht gesetzt ist
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Entsperrt und wendet alle Candidates der Reihe nach an.
    ///
    /// Fehler einzelner Candidates werden geloggt und verschluckt, damit ein
    /// kaputter Candidate den Rest nicht blockiert. Gibt die Anzahl der
    /// erfolgreich angewendeten Candidates zurück.
    pub async fn drain_into(&mut self, connection: &dyn PeerConnection) -> usize {
        self.locked = false;

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Dropping buffered ICE candidate: {}", e),
            }
        }
        applied
    }

    /// Leert die Queue und sperrt sie wieder
    pub fn reset(&mut self) {
        self.pending.clear();
        self.locked = true;
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}
