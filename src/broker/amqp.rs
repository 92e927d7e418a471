//! AMQP transport backed by `lapin`.
//!
//! One [`lapin::Connection`] per link, one channel per session. Sessions are
//! closed by their owner. Link loss is detected through the connection error
//! callback.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tokio_util::sync::CancellationToken;

use crate::broker::error::{BrokerError, Result};
use crate::broker::transport::{
    Acker, Delivery, DeliveryStream, Dialer, Envelope, ExchangeKind, Link, Session,
};
use crate::metadata::Metadata;

/// Dials `amqp://` and `amqps://` addresses.
#[derive(Debug, Default, Clone)]
pub struct AmqpDialer;

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Link>> {
        let conn = lapin::Connection::connect(address, ConnectionProperties::default()).await?;

        let closed = CancellationToken::new();
        let on_error = closed.clone();
        conn.on_error(move |e| {
            tracing::warn!(error = %e, "AMQP connection error");
            on_error.cancel();
        });

        Ok(Arc::new(AmqpLink { conn, closed }))
    }
}

struct AmqpLink {
    conn: lapin::Connection,
    closed: CancellationToken,
}

#[async_trait]
impl Link for AmqpLink {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.conn.status().connected()
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if !self.is_open() {
            return Err(BrokerError::LinkClosed);
        }
        let channel = self.conn.create_channel().await?;
        Ok(Box::new(AmqpSession { channel }))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if self.conn.status().connected() {
            if let Err(e) = self.conn.close(200, "shutting down").await {
                tracing::debug!(error = %e, "AMQP connection close failed");
            }
        }
    }
}

struct AmqpSession {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl Session for AmqpSession {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) {
        if !self.channel.status().connected() {
            return;
        }
        if let Err(e) = self.channel.close(200, "closing").await {
            tracing::debug!(error = %e, "AMQP channel close failed");
        }
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| -> Result<Delivery> {
            let delivery = delivery?;
            Ok(Delivery {
                routing_key: delivery.routing_key.as_str().to_string(),
                headers: read_headers(&delivery.properties),
                payload: Bytes::from(delivery.data),
                acker: Box::new(AmqpAcker(delivery.acker)) as Box<dyn Acker>,
            })
        });
        Ok(deliveries.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type))
            .with_delivery_mode(2);
        if !envelope.headers.is_empty() {
            properties = properties.with_headers(write_headers(&envelope.headers));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

fn write_headers(headers: &Metadata) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        table.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(value.to_string().into()),
        );
    }
    table
}

/// String-valued headers only; other AMQP value types are skipped.
fn read_headers(properties: &BasicProperties) -> Metadata {
    let Some(table) = properties.headers() else {
        return Metadata::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_field_table_conversion() {
        let mut headers = Metadata::new();
        headers.insert("x-request-id", "req-1");
        headers.insert("tenant", "acme");

        let properties = BasicProperties::default().with_headers(write_headers(&headers));
        let read = read_headers(&properties);
        assert_eq!(read.get("x-request-id"), Some("req-1"));
        assert_eq!(read.get("tenant"), Some("acme"));
    }

    #[test]
    fn missing_headers_yield_empty_metadata() {
        assert!(read_headers(&BasicProperties::default()).is_empty());
    }
}
