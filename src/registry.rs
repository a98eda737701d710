//! Protocol Handler Registry.
//!
//! A plain map from frame-type tag to an ordered list of callbacks. This
//! engine has ten-plus subsystems that all want to see inbound frames of
//! specific tags, so dispatch needs an actual table instead of a
//! hand-written `match`.
//!
//! Handlers are deliberately synchronous, non-async callbacks. A handler
//! that wants to react to a frame does so by handing it off to its owning
//! subsystem's task over an `mpsc` channel (a `try_send` inside the
//! closure) rather than `.await`ing anything itself, so a handler never
//! synchronously re-enters the dispatcher — this keeps dispatch itself fast
//! and non-reentrant.

use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{Frame, FrameType};

/// A registered callback. Takes the whole frame (which already carries
/// `from`, so there's no need for a redundant separate sender parameter).
pub type Handler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Maps frame-type tags to the ordered list of handlers registered for
/// them. Handlers registered after a frame of that type has already arrived
/// do not receive it retroactively — there's no buffering here, only
/// immediate fan-out to whoever is registered at dispatch time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<FrameType, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a frame type. Must be called before the
    /// transport adapter's `open()` completes if the caller cares about not
    /// missing early inbound frames — the registry itself doesn't enforce
    /// ordering, it's a plain append.
    pub fn register(&mut self, frame_type: FrameType, handler: Handler) {
        self.handlers.entry(frame_type).or_default().push(handler);
    }

    /// Dispatch an inbound frame to every handler registered for its tag, in
    /// registration order. Frame types with no registered handler are
    /// silently dropped by the caller (see `transport.rs`), which also logs
    /// the drop — the registry itself just reports whether anyone was
    /// listening.
    pub fn dispatch(&self, frame: Frame) -> bool {
        let tag = frame.body.tag();
        match self.handlers.get(&tag) {
            Some(handlers) if !handlers.is_empty() => {
                for handler in handlers {
                    handler(frame.clone());
                }
                true
            }
            _ => false,
        }
    }

    /// Number of handlers currently registered for a tag — mostly useful in
    /// tests asserting registration order and fan-out.
    pub fn handler_count(&self, frame_type: FrameType) -> usize {
        self.handlers.get(&frame_type).map_or(0, Vec::len)
    }
}
