// ABOUTME: Built-in backend implementations (mock, command).
// ABOUTME: Each backend implements the AgentBackend trait and builds from an AgentConfig.

pub mod command;
pub mod mock;
