//! Ambient utilities shared by the gateway library and its binary: request-id
//! plumbing and the header redaction rules used by the structured logger.
//!
//! Grounded on `agent-core`'s role in the teacher workspace: a dependency-light
//! crate that the rest of the workspace leans on for cross-cutting concerns.

pub mod redact;
pub mod reqid;

pub use redact::{is_sensitive_header, redact_headers};
pub use reqid::RequestId;
