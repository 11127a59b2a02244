//! The tunnel core: lifecycle, per-request translation and header policy.

pub mod client;
pub mod engine;
pub mod headers;
pub mod response;
pub mod translator;

pub use client::TargetClient;
pub use engine::{ConnectionState, TunnelEngine};
pub use headers::{classify, HeaderTreatment, PartitionedHeaders};
pub use translator::{OutboundRequest, RequestTranslator, TranslationOutcome};
