//! Mocks and fixtures shared by the evoflow test suites.

pub mod fixtures;
pub mod model;
pub mod store;
pub mod tools;

pub use fixtures::*;
pub use model::{
    json_response, last_user_text, system_text, text_response, tool_call_response, FnModelClient,
    ScriptedModelClient,
};
pub use store::StalledStore;
pub use tools::{EchoTool, FailingTool, SlowTool};
