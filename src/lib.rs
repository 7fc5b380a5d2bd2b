//! Keychain authorization server: WebAuthn ceremonies bound to Decentralized
//! Web Tokens, a PKCE code exchange issuing bearer tokens, and the
//! delegated-signature verifier program those tokens authorize.

pub mod api;
pub mod app;
pub mod chain;
pub mod codec;
pub mod config;
pub mod dwt;
pub mod error;
pub mod middleware;
pub mod program;
pub mod repos;
pub mod services;
pub mod signing;
pub mod state;
