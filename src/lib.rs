//! ShopSync: pulls orders and products from a remote storefront platform,
//! caches them locally, reconciles the authoritative inventory, and projects
//! remote orders into invoices and sales exactly once.

pub mod config;
pub mod logging;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

pub mod util {
    pub mod env;
}
