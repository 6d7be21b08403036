// Stock mutation and reporting
pub mod inventory;

// Backorder allocation
pub mod backorder_allocation;

// Cross-store transfer recommendations
pub mod distance;
pub mod stock_transfer;

pub use backorder_allocation::{
    AllocationOptions, AllocationReport, AllocationResult, AllocationStrategy,
    BackorderAllocationService, CancellationResult, ReceiptResult, RecalculationSummary,
};
pub use inventory::{
    InventoryService, LowStockReport, MovementMeta, StockAvailability, StockLine, TimeSeriesPoint,
};
pub use stock_transfer::{StockTransferService, TransferOption, TransferSuggestion};
