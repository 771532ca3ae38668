//! Production broker adapter on top of `lapin`

use crate::broker::{
    Arguments, Channel, Confirmation, Connection, Connector, Delivery, ExchangeKind,
    ExchangeOptions, FieldValue, Publishing, QueueOptions,
};
use crate::error::{AmqpError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffer between the lapin consumer stream and the delivery feed
const DELIVERY_BUFFER: usize = 64;

type CloseListeners = Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>;

/// Dials AMQP 0-9-1 brokers with lapin
#[derive(Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| AmqpError::dial(e.to_string()))?;

        let listeners: CloseListeners = Arc::new(Mutex::new(Vec::new()));
        let on_error = Arc::clone(&listeners);
        connection.on_error(move |err| {
            warn!("Broker connection error: {}", err);
            if let Ok(mut listeners) = on_error.lock() {
                for listener in listeners.drain(..) {
                    let _ = listener.send(err.to_string());
                }
            }
        });

        Ok(Arc::new(LapinConnection {
            connection,
            listeners,
        }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    listeners: CloseListeners,
}

#[async_trait]
impl Connection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel {
            channel,
            listeners: Arc::clone(&self.listeners),
            confirms: Mutex::new(None),
            publish_seq: AtomicU64::new(0),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| AmqpError::close(e.to_string()))
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    listeners: CloseListeners,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
    publish_seq: AtomicU64,
}

#[async_trait]
impl Channel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: Arguments,
    ) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::RandomRouting => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
        };
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            nowait: options.no_wait,
        };
        self.channel
            .exchange_declare(name, kind, options, field_table(&arguments))
            .await
            .map_err(|e| AmqpError::topology(e.to_string()))
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        routing_key: &str,
        source: &str,
        no_wait: bool,
    ) -> Result<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: no_wait },
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::topology(e.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: Arguments,
    ) -> Result<()> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: options.no_wait,
        };
        self.channel
            .queue_declare(name, options, field_table(&arguments))
            .await
            .map(|_| ())
            .map_err(|e| AmqpError::topology(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::topology(e.to_string()))
    }

    async fn unbind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| AmqpError::topology(e.to_string()))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| AmqpError::qos(e.to_string()))
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    fn notify_publish(&self) -> mpsc::UnboundedReceiver<Confirmation> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut confirms) = self.confirms.lock() {
            *confirms = Some(sender);
        }
        receiver
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("text/plain"))
            .with_headers(field_table(&message.headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| AmqpError::publish(e.to_string()))?;

        let delivery_tag = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = self.confirms.lock().ok().and_then(|guard| guard.clone());
        if let Some(listener) = listener {
            tokio::spawn(async move {
                let ack = match confirm.await {
                    Ok(confirmation) => confirmation.is_ack(),
                    Err(e) => {
                        debug!(delivery_tag, "Confirmation lost: {}", e);
                        false
                    }
                };
                let _ = listener.send(Confirmation { delivery_tag, ack });
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, exclusive: bool) -> Result<mpsc::Receiver<Delivery>> {
        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive,
            nowait: false,
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| AmqpError::subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %queue, "Delivery stream failed: {}", e);
                        break;
                    }
                };
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(arguments)
                    .unwrap_or_default();
                let delivery = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    headers,
                    body: delivery.data,
                };
                if sender.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(queue = %queue, "Delivery stream ended");
        });

        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| AmqpError::ack(e.to_string()))
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(sender);
        }
        receiver
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            FieldValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
            FieldValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => AMQPValue::LongInt(small),
                Err(_) => AMQPValue::LongLongInt(*i),
            },
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn arguments(table: &FieldTable) -> Arguments {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    FieldValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => FieldValue::Str(s.as_str().to_owned()),
                AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
                AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TIMESTAMP_HEADER;

    #[test]
    fn test_field_table_conversion() {
        let mut args = Arguments::new();
        args.insert("x-dead-letter-exchange".to_owned(), "shard-dlx".into());
        args.insert("x-message-ttl".to_owned(), FieldValue::Int(10_000));
        args.insert(TIMESTAMP_HEADER.to_owned(), "1500000000000000000".into());

        let table = field_table(&args);
        assert!(matches!(
            table.inner().get(&ShortString::from("x-message-ttl".to_owned())),
            Some(AMQPValue::LongInt(10_000))
        ));

        assert_eq!(arguments(&table), args);
    }
}
