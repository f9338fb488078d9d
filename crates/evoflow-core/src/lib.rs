pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod payload;
pub mod pricing;
pub mod store;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{AdmissionRejection, EvoflowError, ProviderErrorKind, Result};
pub use event::EventBus;
pub use message::{Message, MessagePatch, SequenceCounter, START_NODE_ID};
pub use payload::{extract_text_from_payload, AggregatedEntry, ControlFlag, Payload};
pub use pricing::{ModelPricing, StaticCatalog};
pub use store::{InMemoryStore, NoopStore};
pub use traits::*;
pub use types::*;
pub use workflow::{
    HandOffType, NodePatch, VerificationError, VerifyOptions, WorkflowConfig, WorkflowEdge,
    WorkflowNodeConfig, END_NODE_ID,
};
