//! 记忆层：发给模型的对话消息、成员设定与动态记忆

pub mod conversation;
pub mod persona;

pub use conversation::{Message, Role};
pub use persona::{
    AgentIdentity, DynamicMemory, MemberConfig, MemberConfigPatch, MemoryEntry, MemoryKind,
};
