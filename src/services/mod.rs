pub mod catalog;
pub mod payments;

pub use catalog::CachedProductCatalog;
pub use payments::PaymentService;
