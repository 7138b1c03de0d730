//! Nesting frames and their bookkeeping.
//!
//! # Responsibility
//! - Model one nesting level of an atomic block (`TransactionFrame`).
//! - Track the frame stack of a session handle (`FrameBook`).
//!
//! # Invariants
//! - `depth == frames.len()`; depth can never go negative.
//! - Frames are pushed and popped strictly LIFO.
//! - Only the root frame (`depth_at_entry == 0`) has no savepoint.
//! - Bookkeeping never performs I/O and never awaits.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// One nesting level of an atomic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFrame {
    depth_at_entry: usize,
    savepoint: Option<String>,
    parent: Option<usize>,
}

impl TransactionFrame {
    /// The frame that would be opened on top of a stack of `depth` frames.
    pub(crate) fn on_top_of(depth: usize) -> Self {
        Self {
            depth_at_entry: depth,
            savepoint: (depth > 0).then(|| savepoint_name(depth + 1)),
            parent: depth.checked_sub(1),
        }
    }

    pub fn depth_at_entry(&self) -> usize {
        self.depth_at_entry
    }

    /// Savepoint name; `None` for the root frame.
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// `depth_at_entry` of the enclosing frame.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.depth_at_entry == 0
    }
}

/// Deterministic savepoint name for the frame that brings the stack to `depth`.
pub(crate) fn savepoint_name(depth: usize) -> String {
    format!("sp_{depth}")
}

/// Attempt to push or pop a frame out of LIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOrderError {
    pub current_depth: usize,
    pub requested_depth: usize,
}

impl Display for FrameOrderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame at depth {} is not the top of a stack of depth {}",
            self.requested_depth, self.current_depth
        )
    }
}

impl Error for FrameOrderError {}

/// Rollback owed for a frame whose block stopped without unwinding itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingUnwind {
    pub frame: TransactionFrame,
    /// The frame's begin/savepoint may never have reached the engine.
    pub best_effort: bool,
}

/// Frame stack plus usability state of one session handle.
#[derive(Debug, Default)]
pub(crate) struct FrameBook {
    frames: Vec<TransactionFrame>,
    pending: Vec<PendingUnwind>,
    invalidated: bool,
    doomed: bool,
}

impl FrameBook {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[TransactionFrame] {
        &self.frames
    }

    pub fn next_frame(&self) -> TransactionFrame {
        TransactionFrame::on_top_of(self.depth())
    }

    pub fn push(&mut self, frame: TransactionFrame) -> Result<(), FrameOrderError> {
        if frame.depth_at_entry != self.depth() {
            return Err(self.order_error(frame.depth_at_entry));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the frame entered at `depth_at_entry`, which must be the top.
    pub fn pop(&mut self, depth_at_entry: usize) -> Result<TransactionFrame, FrameOrderError> {
        let is_top = self
            .frames
            .last()
            .is_some_and(|top| top.depth_at_entry == depth_at_entry);
        let error = self.order_error(depth_at_entry);
        if !is_top {
            return Err(error);
        }
        self.frames.pop().ok_or(error)
    }

    /// Drops `frame` and everything nested in it, queueing one rollback.
    ///
    /// Returns whether anything was queued. A frame that is no longer on the
    /// stack has already been unwound and queues nothing, unless it never got
    /// pushed (`entering`).
    pub fn abandon(&mut self, frame: &TransactionFrame, entering: bool) -> bool {
        let on_stack = self
            .frames
            .get(frame.depth_at_entry)
            .is_some_and(|candidate| candidate == frame);

        if on_stack {
            self.frames.truncate(frame.depth_at_entry);
        } else if !entering || self.depth() != frame.depth_at_entry {
            return false;
        }

        self.pending.push(PendingUnwind {
            frame: frame.clone(),
            best_effort: entering,
        });
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Oldest queued rollback; queued rollbacks are applied in order.
    pub fn next_pending(&mut self) -> Option<PendingUnwind> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.remove(0))
    }

    pub fn clear_pending(&mut self) -> usize {
        std::mem::take(&mut self.pending).len()
    }

    /// Removes every frame, innermost first.
    pub fn drain(&mut self) -> Vec<TransactionFrame> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// The engine discarded the open transaction while frames were still
    /// open; they can only unwind now.
    pub fn doom(&mut self) {
        self.doomed = true;
    }

    pub fn clear_doomed(&mut self) {
        self.doomed = false;
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    fn order_error(&self, requested_depth: usize) -> FrameOrderError {
        FrameOrderError {
            current_depth: self.depth(),
            requested_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameBook, TransactionFrame};

    #[test]
    fn root_frame_has_no_savepoint_and_nested_frames_are_named_by_depth() {
        let mut book = FrameBook::default();
        let root = book.next_frame();
        assert!(root.is_root());
        assert_eq!(root.savepoint(), None);
        assert_eq!(root.parent(), None);
        book.push(root).unwrap();

        let nested = book.next_frame();
        assert_eq!(nested.depth_at_entry(), 1);
        assert_eq!(nested.savepoint(), Some("sp_2"));
        assert_eq!(nested.parent(), Some(0));
        book.push(nested).unwrap();

        assert_eq!(book.next_frame().savepoint(), Some("sp_3"));
        assert_eq!(book.depth(), 2);
    }

    #[test]
    fn pop_rejects_frames_below_the_top() {
        let mut book = FrameBook::default();
        book.push(book.next_frame()).unwrap();
        book.push(book.next_frame()).unwrap();

        let err = book.pop(0).unwrap_err();
        assert_eq!(err.current_depth, 2);
        assert_eq!(err.requested_depth, 0);

        book.pop(1).unwrap();
        book.pop(0).unwrap();
        assert_eq!(book.depth(), 0);
        assert!(book.pop(0).is_err());
    }

    #[test]
    fn push_rejects_frames_planned_for_another_depth() {
        let mut book = FrameBook::default();
        let stale = TransactionFrame::on_top_of(3);
        assert!(book.push(stale).is_err());
        assert_eq!(book.depth(), 0);
    }

    #[test]
    fn abandon_truncates_nested_frames_and_queues_one_rollback() {
        let mut book = FrameBook::default();
        book.push(book.next_frame()).unwrap();
        let middle = book.next_frame();
        book.push(middle.clone()).unwrap();
        book.push(book.next_frame()).unwrap();

        assert!(book.abandon(&middle, false));
        assert_eq!(book.depth(), 1);
        assert!(book.has_pending());

        let pending = book.next_pending().expect("queued rollback");
        assert_eq!(pending.frame, middle);
        assert!(!pending.best_effort);
        assert!(book.next_pending().is_none());
        assert!(!book.has_pending());

        assert!(!book.abandon(&middle, false));
    }

    #[test]
    fn abandon_while_entering_queues_best_effort_rollback() {
        let mut book = FrameBook::default();
        let planned = book.next_frame();
        assert!(book.abandon(&planned, true));
        let pending = book.next_pending().expect("queued rollback");
        assert!(pending.best_effort);
        assert_eq!(book.depth(), 0);
    }

    #[test]
    fn drain_returns_innermost_first() {
        let mut book = FrameBook::default();
        book.push(book.next_frame()).unwrap();
        book.push(book.next_frame()).unwrap();
        let drained = book.drain();
        assert_eq!(drained[0].depth_at_entry(), 1);
        assert_eq!(drained[1].depth_at_entry(), 0);
        assert_eq!(book.depth(), 0);
    }
}
