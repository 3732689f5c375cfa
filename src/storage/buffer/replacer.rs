use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy over the frame-id space of a buffer pool.
///
/// The replacer tracks the set of eligible frames: those whose pin count has
/// dropped to zero. It never sees page ids or touches frame contents. The pool
/// calls every method under its own lock, so implementations need no interior
/// synchronization.
pub trait Replacer: Send + Sync + Debug {
    /// Remove one eligible frame and return it, or `None` if the set is empty.
    /// A returned frame is no longer tracked; pinning it afterwards is a no-op.
    fn victim(&mut self) -> Option<FrameId>;

    /// Take a frame out of the eligible set. Pinning a frame that is already
    /// pinned, or was never unpinned, does nothing.
    fn pin(&mut self, frame_id: FrameId);

    /// Add a frame to the eligible set. Unpinning a frame that is already
    /// eligible does nothing, and ids at or above the pool size are ignored.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of eligible frames.
    fn size(&self) -> usize;
}
