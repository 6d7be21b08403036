pub mod allocation_priority_log;
pub mod customer;
pub mod inventory;
pub mod inventory_transaction;
pub mod order;
pub mod order_item;
pub mod purchase_item;
pub mod stock_transfer;
pub mod store;
