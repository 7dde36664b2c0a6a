pub mod coordinator;
pub mod events;
pub mod state;

pub use coordinator::{PipelineDeps, SessionCoordinator};
pub use events::EventForwarder;
pub use state::{CoordinatorStatus, ExamContext, GenerationStatus, PeerStatus};
