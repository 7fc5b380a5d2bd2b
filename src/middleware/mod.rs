/*
 * Responsibility
 * - Router-level middleware shared by every route
 */
pub mod cors;
pub mod http;
pub mod security_headers;
