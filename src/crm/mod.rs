//! CRM client: typed wrapper over the CRM HTTP/JSON API with per-call
//! retry, rate limiting, and batch coalescing.

pub mod client;
pub mod rate_limit;
pub mod types;

pub use client::{CrmClient, BATCH_LIMIT};
pub use rate_limit::RateLimiter;
pub use types::{Contact, ContactFields, Deal, DealBrief, DealFields, Lead, LeadConversion};
