//! Live study session: roster, coordinator and runtime
//!
//! ```text
//! SignalingClient ──TransportEvent──┐
//! PeerConnection ────PeerEvent──────┤
//! LocalTrack ────────MediaEvent─────┼──> SessionCoordinator::dispatch
//! SpeakingDetector ──bool───────────┤        (one task)
//! StudySession ──────SessionCommand─┘
//! ```

pub mod api;
pub mod coordinator;
pub mod heartbeat;
pub mod roster;
pub mod runtime;

pub use api::{ActivityPinger, StudyGroupApi};
pub use coordinator::{Flow, LocalIdentity, SessionCommand, SessionCoordinator, SessionInput};
pub use heartbeat::Heartbeat;
pub use roster::{Participant, Roster};
pub use runtime::StudySession;
