pub mod auth_code_repo;
pub mod credential_repo;
pub mod error;
pub mod pending_claim_repo;
