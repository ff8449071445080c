//! Credential handling for FleetCI.
//!
//! - `crypto`: AES-256-GCM encryption of stored secrets
//! - `resolver`: injection of bound credentials into job environments
//! - `masker`: redaction of secret values from job output

pub mod crypto;
pub mod masker;
pub mod resolver;

pub use crypto::{CryptoError, SecretCipher};
pub use masker::{LogMasker, MASK};
pub use resolver::{CredentialError, CredentialResolver, ResolvedEnvironment, env_name};
