pub mod api;
pub mod error;
pub mod purchase;
pub mod storefront;
