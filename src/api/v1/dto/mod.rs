pub mod ceremony_request;
pub mod ceremony_response;
pub mod token_request;
pub mod token_response;
