/// Writability signal derived from the pending outbound byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterestChange {
    BecameWritable,
    BecameUnwritable,
}

/// Pending-byte accounting against a high and a low watermark.
///
/// Writability turns off once the pending count rises above `high` and turns back on once it
/// falls to `low` or below. Between the two the previous state holds, so a writer hovering
/// around one threshold does not produce a stream of flips.
#[derive(Debug)]
pub(crate) struct WriteWatermarks {
    high: usize,
    low: usize,
    pending: usize,
    writable: bool,
}

impl WriteWatermarks {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low: low.min(high),
            pending: 0,
            writable: true,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    /// Records `len` bytes handed to the outbound queue.
    pub(crate) fn enqueued(&mut self, len: usize) -> Option<InterestChange> {
        self.pending = self.pending.saturating_add(len);
        if self.writable && self.pending > self.high {
            self.writable = false;
            return Some(InterestChange::BecameUnwritable);
        }
        None
    }

    /// Records `len` bytes written and flushed to the transport.
    pub(crate) fn written(&mut self, len: usize) -> Option<InterestChange> {
        self.pending = self.pending.saturating_sub(len);
        if !self.writable && self.pending <= self.low {
            self.writable = true;
            return Some(InterestChange::BecameWritable);
        }
        None
    }
}
