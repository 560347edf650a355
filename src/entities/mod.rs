pub mod order;
pub mod payment_dead_letter;
pub mod product;
