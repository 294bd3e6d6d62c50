//! 记忆层：对话轮次（运行前的历史）与运行内只追加的 Memory

pub mod conversation;
pub mod episode;

pub use conversation::{ConversationMemory, Message, Role};
pub use episode::{Memory, MemoryEntry};
