//! Session lifecycle: durable records, the transactional engine, and the
//! request/response types of the control-plane API.

mod engine;
mod models;
mod repository;

pub use engine::{EngineConfig, SessionEngine};
pub use models::{CreateSessionRequest, CreateSessionResponse, SessionRecord, SessionStats};
pub use repository::SessionRepository;
