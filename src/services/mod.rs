// Core services
pub mod addresses;
pub mod carts;
pub mod checkout;
pub mod order_status;
pub mod orders;
pub mod pricing;
pub mod reservations;
