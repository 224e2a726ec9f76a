//! Persistent models for the order/cart store.

pub mod cart_item;
pub mod order;
pub mod order_activity;
pub mod order_item;
pub mod session;
pub mod shipping_address;
