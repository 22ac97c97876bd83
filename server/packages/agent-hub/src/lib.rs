pub mod acp;
pub mod agents;
pub mod cache;
pub mod cli;
pub mod compose;
pub mod permissions;
pub mod router;
pub mod runtime;
pub mod sse;
