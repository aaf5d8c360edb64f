//! The priority band queue.
//!
//! One doubly linked list, arena-backed: a head sentinel, then for each of
//! the 31 priority bands the band's jobs followed by the band's marker, then
//! a tail sentinel. Jobs link in immediately before their band's marker
//! (tail of band); a cooperative re-queue links in immediately after the
//! previous band's marker (head of band). The fixed marker array doubles as
//! the marker-only list, giving O(1) hops between bands.
//!
//! The high-water-mark caches the band index of the highest band that may
//! contain work. It is maintained pessimistically — never above the true
//! highest — on enqueue, priority change, drain arrival, and as the pump
//! crosses band boundaries, so "is higher work pending" is O(1).

use super::job::JobRecord;
use crate::types::{Priority, BAND_COUNT};
use crate::util::{Arena, ArenaIndex};

pub(crate) struct Node {
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
    body: Body,
}

pub(crate) enum Body {
    Head,
    Marker(usize),
    Tail,
    Job(JobRecord),
}

pub(crate) struct BandQueue {
    nodes: Arena<Node>,
    head: ArenaIndex,
    markers: [ArenaIndex; BAND_COUNT],
    tail: ArenaIndex,
    /// Band index of the highest band that may hold a job; `BAND_COUNT`
    /// when the queue is known empty.
    hwm_band: usize,
    /// Live job records, linked or not.
    job_count: usize,
}

impl BandQueue {
    pub(crate) fn new() -> Self {
        let mut nodes = Arena::new();
        let head = nodes.insert(Node {
            prev: None,
            next: None,
            body: Body::Head,
        });
        let markers = core::array::from_fn(|band| {
            nodes.insert(Node {
                prev: None,
                next: None,
                body: Body::Marker(band),
            })
        });
        let tail = nodes.insert(Node {
            prev: None,
            next: None,
            body: Body::Tail,
        });

        let mut queue = Self {
            nodes,
            head,
            markers,
            tail,
            hwm_band: BAND_COUNT,
            job_count: 0,
        };
        let mut prev = head;
        for marker in queue.markers {
            queue.wire(prev, marker);
            prev = marker;
        }
        queue.wire(prev, tail);
        queue
    }

    fn wire(&mut self, a: ArenaIndex, b: ArenaIndex) {
        if let Some(node) = self.nodes.get_mut(a) {
            node.next = Some(b);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.prev = Some(a);
        }
    }

    /// The anchor a band-head insert goes after: the previous band's marker,
    /// or the list head for the highest band.
    fn anchor_before(&self, band: usize) -> ArenaIndex {
        if band == 0 {
            self.head
        } else {
            self.markers[band - 1]
        }
    }

    /// Inserts a fresh job record, linked at the tail of `band`.
    pub(crate) fn insert_job(&mut self, band: usize, record: JobRecord) -> ArenaIndex {
        let idx = self.nodes.insert(Node {
            prev: None,
            next: None,
            body: Body::Job(record),
        });
        self.job_count += 1;
        self.link_tail(idx, band);
        idx
    }

    /// Links an unlinked job at the tail of `band` (behind existing work).
    pub(crate) fn link_tail(&mut self, idx: ArenaIndex, band: usize) {
        let marker = self.markers[band];
        let prev = self
            .nodes
            .get(marker)
            .and_then(|n| n.prev)
            .expect("markers are always linked");
        self.splice(prev, idx, marker);
        self.note_enqueue(band);
    }

    /// Links an unlinked job at the head of `band` (bounded resumption
    /// latency for work that already started).
    pub(crate) fn link_head(&mut self, idx: ArenaIndex, band: usize) {
        let anchor = self.anchor_before(band);
        let next = self
            .nodes
            .get(anchor)
            .and_then(|n| n.next)
            .expect("anchors are always linked");
        self.splice(anchor, idx, next);
        self.note_enqueue(band);
    }

    fn splice(&mut self, prev: ArenaIndex, idx: ArenaIndex, next: ArenaIndex) {
        if let Some(node) = self.nodes.get_mut(idx) {
            node.prev = Some(prev);
            node.next = Some(next);
        }
        if let Some(node) = self.nodes.get_mut(prev) {
            node.next = Some(idx);
        }
        if let Some(node) = self.nodes.get_mut(next) {
            node.prev = Some(idx);
        }
    }

    /// Unlinks a job from its band; the record stays alive in the arena.
    pub(crate) fn unlink(&mut self, idx: ArenaIndex) {
        let (prev, next) = match self.nodes.get_mut(idx) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        if let (Some(prev), Some(next)) = (prev, next) {
            self.wire(prev, next);
        }
    }

    /// Returns true while the job is linked into a band.
    pub(crate) fn is_linked(&self, idx: ArenaIndex) -> bool {
        self.nodes.get(idx).is_some_and(|n| n.prev.is_some())
    }

    /// First queued job of `band`, if any.
    pub(crate) fn first_job_in_band(&self, band: usize) -> Option<ArenaIndex> {
        let anchor = self.anchor_before(band);
        let next = self.nodes.get(anchor).and_then(|n| n.next)?;
        match self.nodes.get(next).map(|n| &n.body) {
            Some(Body::Job(_)) => Some(next),
            _ => None,
        }
    }

    /// Highest populated band at or below (index-wise, at or after) `from`.
    pub(crate) fn highest_band_from(&self, from: usize) -> Option<usize> {
        (from..BAND_COUNT).find(|&band| self.first_job_in_band(band).is_some())
    }

    pub(crate) fn job(&self, idx: ArenaIndex) -> Option<&JobRecord> {
        match self.nodes.get(idx).map(|n| &n.body) {
            Some(Body::Job(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn job_mut(&mut self, idx: ArenaIndex) -> Option<&mut JobRecord> {
        match self.nodes.get_mut(idx).map(|n| &mut n.body) {
            Some(Body::Job(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn contains_job(&self, idx: ArenaIndex) -> bool {
        self.job(idx).is_some()
    }

    /// Unlinks and frees a terminal job's node.
    pub(crate) fn remove_job(&mut self, idx: ArenaIndex) -> Option<JobRecord> {
        if !self.contains_job(idx) {
            return None;
        }
        self.unlink(idx);
        self.job_count -= 1;
        match self.nodes.remove(idx).map(|n| n.body) {
            Some(Body::Job(record)) => Some(record),
            _ => None,
        }
    }

    /// Live job records, linked or not.
    pub(crate) fn job_count(&self) -> usize {
        self.job_count
    }

    pub(crate) fn hwm_band(&self) -> usize {
        self.hwm_band
    }

    /// Pessimistic raise on enqueue into `band`.
    pub(crate) fn note_enqueue(&mut self, band: usize) {
        if band < self.hwm_band {
            self.hwm_band = band;
        }
    }

    /// The pump confirmed every band above `band` is empty.
    pub(crate) fn set_hwm(&mut self, band: usize) {
        self.hwm_band = band;
    }

    /// A drain became current: assume anything may be pending.
    pub(crate) fn raise_hwm_to_top(&mut self) {
        self.hwm_band = 0;
    }

    /// Returns true if any linked job has priority at or above `threshold`.
    pub(crate) fn has_job_at_or_above(&self, threshold: Priority) -> bool {
        self.highest_band_from(0)
            .is_some_and(|band| band <= threshold.band())
    }

    /// Queued jobs of `band`, head to tail.
    pub(crate) fn band_jobs(&self, band: usize) -> Vec<ArenaIndex> {
        let mut jobs = Vec::new();
        let mut cursor = self.nodes.get(self.anchor_before(band)).and_then(|n| n.next);
        while let Some(idx) = cursor {
            match self.nodes.get(idx) {
                Some(node) => match &node.body {
                    Body::Job(_) => {
                        jobs.push(idx);
                        cursor = node.next;
                    }
                    Body::Head | Body::Marker(_) | Body::Tail => break,
                },
                None => break,
            }
        }
        jobs
    }

    /// Live jobs that are not linked into any band (paused or blocked).
    pub(crate) fn detached_jobs(&self) -> Vec<ArenaIndex> {
        self.nodes
            .iter()
            .filter(|(_, node)| matches!(node.body, Body::Job(_)) && node.prev.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }
}

impl std::fmt::Debug for BandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandQueue")
            .field("jobs", &self.job_count)
            .field("hwm_band", &self.hwm_band)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    fn record(id: u32, priority: Priority) -> JobRecord {
        let mut rec = JobRecord::new(
            JobId::from_raw(id),
            priority,
            format!("job-{id}"),
            Box::new(|_| {}),
        );
        rec.enter();
        rec
    }

    fn ids(queue: &BandQueue, band: usize) -> Vec<u32> {
        queue
            .band_jobs(band)
            .into_iter()
            .filter_map(|idx| queue.job(idx).map(|r| r.id.get()))
            .collect()
    }

    #[test]
    fn tail_insert_is_fifo_within_a_band() {
        let mut queue = BandQueue::new();
        let band = Priority::NORMAL.band();
        queue.insert_job(band, record(1, Priority::NORMAL));
        queue.insert_job(band, record(2, Priority::NORMAL));
        queue.insert_job(band, record(3, Priority::NORMAL));
        assert_eq!(ids(&queue, band), vec![1, 2, 3]);
    }

    #[test]
    fn head_insert_front_runs_the_band() {
        let mut queue = BandQueue::new();
        let band = Priority::NORMAL.band();
        queue.insert_job(band, record(1, Priority::NORMAL));
        let idx = queue.insert_job(band, record(2, Priority::NORMAL));
        queue.unlink(idx);
        queue.link_head(idx, band);
        assert_eq!(ids(&queue, band), vec![2, 1]);
    }

    #[test]
    fn bands_stay_separate() {
        let mut queue = BandQueue::new();
        queue.insert_job(Priority::HIGH.band(), record(1, Priority::HIGH));
        queue.insert_job(Priority::NORMAL.band(), record(2, Priority::NORMAL));
        assert_eq!(ids(&queue, Priority::HIGH.band()), vec![1]);
        assert_eq!(ids(&queue, Priority::NORMAL.band()), vec![2]);
        assert_eq!(
            queue.highest_band_from(0),
            Some(Priority::HIGH.band()),
            "scan finds the highest populated band"
        );
    }

    #[test]
    fn hwm_tracks_enqueues_pessimistically() {
        let mut queue = BandQueue::new();
        assert_eq!(queue.hwm_band(), BAND_COUNT);
        queue.insert_job(Priority::NORMAL.band(), record(1, Priority::NORMAL));
        assert_eq!(queue.hwm_band(), Priority::NORMAL.band());
        queue.insert_job(Priority::HIGH.band(), record(2, Priority::HIGH));
        assert_eq!(queue.hwm_band(), Priority::HIGH.band());
        // Lower-priority enqueues never move it down.
        queue.insert_job(Priority::IDLE.band(), record(3, Priority::IDLE));
        assert_eq!(queue.hwm_band(), Priority::HIGH.band());
    }

    #[test]
    fn unlink_keeps_the_record_alive() {
        let mut queue = BandQueue::new();
        let band = Priority::NORMAL.band();
        let idx = queue.insert_job(band, record(1, Priority::NORMAL));
        queue.unlink(idx);
        assert!(ids(&queue, band).is_empty());
        assert!(queue.contains_job(idx));
        assert!(!queue.is_linked(idx));
        assert_eq!(queue.detached_jobs(), vec![idx]);
        assert_eq!(queue.job_count(), 1);
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut queue = BandQueue::new();
        let band = Priority::NORMAL.band();
        let idx = queue.insert_job(band, record(1, Priority::NORMAL));
        assert!(queue.remove_job(idx).is_some());
        assert!(!queue.contains_job(idx));
        assert_eq!(queue.job_count(), 0);
        // Stale handle stays dead even after slot reuse.
        let fresh = queue.insert_job(band, record(2, Priority::NORMAL));
        assert!(queue.job(idx).is_none());
        assert!(queue.job(fresh).is_some());
    }

    #[test]
    fn has_job_at_or_above_respects_the_threshold() {
        let mut queue = BandQueue::new();
        queue.insert_job(Priority::NORMAL.band(), record(1, Priority::NORMAL));
        assert!(queue.has_job_at_or_above(Priority::NORMAL));
        assert!(queue.has_job_at_or_above(Priority::MIN));
        assert!(!queue.has_job_at_or_above(Priority::HIGH));
    }
}
