//! Built-in constraint processors

pub mod anonymize;
pub mod geo;
pub mod rate_limit;
pub mod time_window;

pub use anonymize::AnonymizeProcessor;
pub use geo::GeoRestrictProcessor;
pub use rate_limit::RateLimitProcessor;
pub use time_window::TimeWindowProcessor;
