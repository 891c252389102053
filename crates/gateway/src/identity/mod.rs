pub mod cache;
pub mod classify;
pub mod extractor;
pub mod provider;

pub use cache::{CredentialDigest, IdentityCache};
pub use classify::{TokenShape, classify};
pub use extractor::{ExtractedCredential, Scheme, extract_credential};
pub use provider::{AuthRequirement, CredentialKind, GitHubIdentityProvider, IdentityProvider, Principal};
