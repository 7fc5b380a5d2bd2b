/*
 * Responsibility
 * - Domain services behind the HTTP handlers
 * - cache: key/value backends (Valkey, in-memory)
 * - webauthn: ceremonies bound to claims
 * - exchange: PKCE authorization codes
 * - token: bearer tokens carrying a claim
 */
pub mod cache;
pub mod exchange;
pub mod token;
pub mod webauthn;
