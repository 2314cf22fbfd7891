//! Broker topology for one agent
//!
//! Names and queue arguments are computed without a broker so they can be
//! checked in unit tests; [`Topology::declare`] applies them to a channel.

use crate::config::QueueSection;
use crate::protocol::messages::OutboundMessage;
use crate::transport::TransportError;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::debug;

const MESSAGE_TTL_ARG: &str = "x-message-ttl";

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub server_id: String,
    pub commands_exchange: String,
    pub command_queue: String,
    pub results_queue: String,
    pub logs_exchange: String,
    pub heartbeats_queue: String,
    pub message_ttl_ms: u32,
    pub heartbeat_ttl_ms: u32,
}

/// Where an outbound record is published: `(exchange, routing_key)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
}

impl Topology {
    pub fn new(server_id: &str, section: &QueueSection) -> Self {
        let message_ttl_ms = section.message_ttl_hours.saturating_mul(3_600_000);
        Self {
            server_id: server_id.to_string(),
            commands_exchange: section.commands_exchange.clone(),
            command_queue: command_queue_name(server_id),
            results_queue: section.results_queue.clone(),
            logs_exchange: section.logs_exchange.clone(),
            heartbeats_queue: section.heartbeats_queue.clone(),
            message_ttl_ms,
            heartbeat_ttl_ms: section.heartbeat_ttl_secs.saturating_mul(1000),
        }
    }

    pub fn command_queue_args(&self) -> FieldTable {
        ttl_args(self.message_ttl_ms)
    }

    pub fn heartbeat_queue_args(&self) -> FieldTable {
        ttl_args(self.heartbeat_ttl_ms)
    }

    /// Status and results share the results queue; logs fan out
    pub fn target_for(&self, message: &OutboundMessage) -> PublishTarget<'_> {
        match message {
            OutboundMessage::Status(_) | OutboundMessage::Result(_) => PublishTarget {
                exchange: "",
                routing_key: &self.results_queue,
            },
            OutboundMessage::Log(_) => PublishTarget {
                exchange: &self.logs_exchange,
                routing_key: "",
            },
            OutboundMessage::Heartbeat(_) => PublishTarget {
                exchange: "",
                routing_key: &self.heartbeats_queue,
            },
        }
    }

    pub async fn declare(&self, channel: &Channel) -> Result<(), TransportError> {
        channel
            .exchange_declare(
                &self.commands_exchange,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(topology_error(&self.commands_exchange))?;
        channel
            .queue_declare(&self.command_queue, durable_queue(), self.command_queue_args())
            .await
            .map_err(topology_error(&self.command_queue))?;
        channel
            .queue_bind(
                &self.command_queue,
                &self.commands_exchange,
                &self.server_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology_error(&self.command_queue))?;

        channel
            .queue_declare(&self.results_queue, durable_queue(), FieldTable::default())
            .await
            .map_err(topology_error(&self.results_queue))?;
        channel
            .exchange_declare(
                &self.logs_exchange,
                ExchangeKind::Fanout,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(topology_error(&self.logs_exchange))?;
        channel
            .queue_declare(
                &self.heartbeats_queue,
                durable_queue(),
                self.heartbeat_queue_args(),
            )
            .await
            .map_err(topology_error(&self.heartbeats_queue))?;

        debug!(
            command_queue = %self.command_queue,
            exchange = %self.commands_exchange,
            "Broker topology declared"
        );
        Ok(())
    }
}

pub fn command_queue_name(server_id: &str) -> String {
    format!("hostlink.agent.{server_id}.commands")
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn ttl_args(ttl_ms: u32) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(MESSAGE_TTL_ARG.into(), AMQPValue::LongUInt(ttl_ms));
    args
}

fn topology_error(name: &str) -> impl Fn(lapin::Error) -> TransportError + '_ {
    move |e| TransportError::TopologyFailed(format!("{name}: {e}"))
}
