pub mod compressor;
pub mod controller;
pub mod conversation;
pub mod embedder;
pub mod packet;
pub mod proximity;
pub mod session;
pub mod temporal;

#[cfg(test)]
mod testing;

pub use compressor::{CompressionOutcome, CycleCompressor};
pub use controller::{Collaborators, DiscardReason, TrafficController, TurnOutcome, generate_with_cache};
pub use conversation::{ConversationLog, ConversationWindow, Message, Role, Turn};
pub use embedder::{OllamaEmbedder, embedder_from_config};
pub use packet::{PacketBuilder, TurnContext, is_memory_intent};
pub use proximity::{Detection, ProximityDetector, ProximityState, ProximityTracker};
pub use session::Session;
pub use temporal::{TemporalContext, TimeKeeper};
