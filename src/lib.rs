pub mod calls;
pub mod config;
pub mod events;
pub mod identity;
pub mod media;
pub mod peer;
pub mod relay;
pub mod transport;

pub use calls::{CallError, CallManager, CallPhase, Participant, SessionSnapshot};
pub use config::CallConfig;
pub use events::{CallNotice, EventBus, PhaseChanged};
