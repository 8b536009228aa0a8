use crate::model::{Id, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booked {
    pub reservation_id: Id,
    pub span: Span,
}

/// Committed reservations on one court, sorted by `span.start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourtTimeline {
    entries: Vec<Booked>,
}

impl CourtTimeline {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation_id: Id, span: Span) {
        let pos = self
            .entries
            .binary_search_by_key(&span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, Booked { reservation_id, span });
    }

    pub fn remove(&mut self, reservation_id: Id) -> Option<Booked> {
        let pos = self
            .entries
            .iter()
            .position(|b| b.reservation_id == reservation_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booked> {
        let right_bound = self.entries.partition_point(|b| b.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
