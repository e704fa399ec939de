//! Frame capture state machine.
//!
//! The host delivers one render surface per plugin render call, always in
//! the order normals, depth, output target. [`FrameCapture`] collects them
//! and reports when a frame's set is complete. The state value carries the
//! surfaces received so far, so a set can only be observed once all three
//! are present.

use crate::surface::SurfaceHandle;

/// The three surfaces one inference step needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedSurfaces {
    pub normals: SurfaceHandle,
    pub depth: SurfaceHandle,
    pub output: SurfaceHandle,
}

/// Which slot of the capture a surface fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceRole {
    Normals,
    Depth,
    OutputTarget,
}

/// Capture progress for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    AwaitingNormals,
    AwaitingDepth {
        normals: SurfaceHandle,
    },
    AwaitingOutputTarget {
        normals: SurfaceHandle,
        depth: SurfaceHandle,
    },
    Complete(CapturedSurfaces),
}

/// Field-less view of [`CaptureState`] for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    AwaitingNormals,
    AwaitingDepth,
    AwaitingOutputTarget,
    Complete,
}

/// What a delivery did to the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Surface stored; more are needed.
    Accepted(SurfaceRole),
    /// Surface stored and the set is now complete.
    Completed(CapturedSurfaces),
    /// The capture was already complete; the surface was dropped.
    Ignored,
    /// The caller labelled the surface with a role other than the awaited one.
    OutOfOrder {
        expected: SurfaceRole,
        got: SurfaceRole,
    },
}

impl CaptureState {
    /// The role the next delivery fills, or `None` once complete.
    pub fn awaiting(&self) -> Option<SurfaceRole> {
        match self {
            CaptureState::AwaitingNormals => Some(SurfaceRole::Normals),
            CaptureState::AwaitingDepth { .. } => Some(SurfaceRole::Depth),
            CaptureState::AwaitingOutputTarget { .. } => Some(SurfaceRole::OutputTarget),
            CaptureState::Complete(_) => None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        match self {
            CaptureState::AwaitingNormals => CapturePhase::AwaitingNormals,
            CaptureState::AwaitingDepth { .. } => CapturePhase::AwaitingDepth,
            CaptureState::AwaitingOutputTarget { .. } => CapturePhase::AwaitingOutputTarget,
            CaptureState::Complete(_) => CapturePhase::Complete,
        }
    }

    /// Transition function: advance by exactly one step.
    pub fn advance(self, surface: SurfaceHandle) -> (CaptureState, Delivery) {
        match self {
            CaptureState::AwaitingNormals => (
                CaptureState::AwaitingDepth { normals: surface },
                Delivery::Accepted(SurfaceRole::Normals),
            ),
            CaptureState::AwaitingDepth { normals } => (
                CaptureState::AwaitingOutputTarget {
                    normals,
                    depth: surface,
                },
                Delivery::Accepted(SurfaceRole::Depth),
            ),
            CaptureState::AwaitingOutputTarget { normals, depth } => {
                let set = CapturedSurfaces {
                    normals,
                    depth,
                    output: surface,
                };
                (CaptureState::Complete(set), Delivery::Completed(set))
            }
            complete @ CaptureState::Complete(_) => (complete, Delivery::Ignored),
        }
    }
}

/// Per-frame surface collector driven by host render callbacks.
#[derive(Debug, Default)]
pub struct FrameCapture {
    state: CaptureState,
}

impl FrameCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the next surface in host order.
    pub fn deliver(&mut self, surface: SurfaceHandle) -> Delivery {
        let (next, delivery) = self.state.advance(surface);
        self.state = next;
        tracing::trace!(?delivery, %surface, "surface delivered");
        delivery
    }

    /// Deliver a surface the caller has labelled with a role. A label that
    /// does not match the awaited slot leaves the state untouched.
    pub fn deliver_as(&mut self, role: SurfaceRole, surface: SurfaceHandle) -> Delivery {
        match self.state.awaiting() {
            Some(expected) if expected != role => Delivery::OutOfOrder {
                expected,
                got: role,
            },
            _ => self.deliver(surface),
        }
    }

    /// Frame boundary: forget this frame's surfaces.
    pub fn end_frame(&mut self) {
        self.state = CaptureState::AwaitingNormals;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.phase()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, CaptureState::Complete(_))
    }

    /// The complete surface set, if this frame has one.
    pub fn surfaces(&self) -> Option<CapturedSurfaces> {
        match self.state {
            CaptureState::Complete(set) => Some(set),
            _ => None,
        }
    }
}
