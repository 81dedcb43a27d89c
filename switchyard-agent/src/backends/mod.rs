// ABOUTME: Backend implementations (ACP, mock).
// ABOUTME: Each backend runs a worker behind an AgentHandle command channel.

pub mod mock;

#[cfg(feature = "acp")]
pub mod acp;
