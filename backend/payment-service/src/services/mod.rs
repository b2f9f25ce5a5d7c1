pub mod invoices;
pub mod payments;
pub mod settlement;

pub use invoices::{
    create_invoice_queue, invoice_job_handler, spawn_invoice_worker, InvoiceJob, InvoiceStore,
};
pub use payments::{OrderFlow, PaymentService, PaymentStore, TransactionStore};
pub use settlement::{
    create_settlement_queue, settlement_handler, spawn_settlement_worker, SettlementJob,
};
