pub mod client_context;
pub mod tenant;

pub use client_context::ClientInfo;
pub use tenant::TenantContext;
