//! Durable queue transport (AMQP 0-9-1 via `lapin`)

pub mod client;
pub mod delivery;
pub mod topology;

pub use client::{validate_broker_url, AmqpPublisher, AmqpTransport};
pub use delivery::{process_delivery, settle, DeliveryAcker, Disposition, InboundDelivery, RetryLedger};
pub use topology::{command_queue_name, Topology};
