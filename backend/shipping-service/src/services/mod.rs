pub mod fulfillment;
pub mod shipments;

pub use fulfillment::{
    create_fulfillment_queue, fulfillment_handler, spawn_fulfillment_worker, Fulfillment,
    FulfillmentJob, ShipmentStore, TrackingLog,
};
pub use shipments::ShippingService;
