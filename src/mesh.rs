//! Full-mesh room: one negotiated peer link per remote participant, each
//! carrying chat, file and draw channels

mod channels;
mod negotiation;
mod registry;
mod session;
mod transfer;

pub use channels::{ChannelLabel, ChatMessage, DrawMessage, ReceivedFile};
pub use negotiation::{NegotiationState, Role};
pub use registry::PeerSummary;
pub use session::{Session, SessionError, SessionHandle};
pub use transfer::{CompletedFile, FileAssembler, TransferState};
