use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::api::InputError;
use crate::config::KafkaConfig;
use crate::event::{Entry, Event};
use crate::prometheus::{report_dropped_events, EVENTS_EMITTED_TOTAL};
use crate::sinks::EventSink;

struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The rdkafka loop is alive as long as it keeps calling us
        self.liveness.report_healthy_blocking();

        gauge!("http_input_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("http_input_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("http_input_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("http_input_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("http_input_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let broker = format!("{}", stats.nodeid);
            gauge!("http_input_kafka_broker_requests_pending", "broker" => broker.clone())
                .set(stats.outbuf_cnt as f64);
            counter!("http_input_kafka_broker_tx_errors_total", "broker" => broker.clone())
                .absolute(stats.txerrs);
            counter!("http_input_kafka_broker_rx_errors_total", "broker" => broker)
                .absolute(stats.rxerrs);
        }
    }
}

/// Produces every event as one JSON message `{"tag", "time", "record"}`, keyed by tag.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(config: KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.max.bytes",
                config.kafka_producer_message_max_bytes.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Fail startup if no broker answers within 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaSink {
            producer,
            topic: config.kafka_topic,
        })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn kafka_send(
        producer: &FutureProducer<KafkaContext>,
        topic: &str,
        event: &Event,
    ) -> Result<DeliveryFuture, InputError> {
        if event.tag.is_empty() {
            report_dropped_events("empty_tag", 1);
            return Err(InputError::EmptyTag);
        }

        let payload = serde_json::to_string(event).map_err(|e| {
            error!("failed to serialize event: {}", e);
            InputError::NonRetryableSinkError
        })?;

        match producer.send_result(FutureRecord {
            topic,
            payload: Some(&payload),
            partition: None,
            key: Some(event.tag.as_str()),
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    report_dropped_events("kafka_message_size", 1);
                    Err(InputError::EventTooBig)
                }
                _ => {
                    report_dropped_events("kafka_write_error", 1);
                    error!("failed to produce event: {}", e);
                    Err(InputError::RetryableSinkError)
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), InputError> {
        match delivery.await {
            Err(_) => {
                // Cancelled after exhausting retries until message.timeout.ms
                counter!("http_input_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(InputError::RetryableSinkError)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                report_dropped_events("kafka_message_size", 1);
                Err(InputError::EventTooBig)
            }
            Ok(Err((err, _))) => {
                counter!("http_input_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(InputError::RetryableSinkError)
            }
            Ok(Ok(_)) => {
                counter!(EVENTS_EMITTED_TOTAL).increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    #[instrument(skip_all, fields(tag = %event.tag))]
    async fn send(&self, event: Event) -> Result<(), InputError> {
        let ack = Self::kafka_send(&self.producer, &self.topic, &event)?;
        histogram!("http_input_batch_size").record(1.0);
        Self::process_ack(ack)
            .instrument(info_span!("ack_wait_one"))
            .await
    }

    #[instrument(skip_all, fields(tag = %tag, size = entries.len()))]
    async fn send_batch(&self, tag: String, entries: Vec<Entry>) -> Result<(), InputError> {
        let mut set = JoinSet::new();
        let batch_size = entries.len();
        for entry in entries {
            let event = Event {
                tag: tag.clone(),
                time: entry.time,
                record: entry.record,
            };
            // Enqueue in order, then wait for the broker acks concurrently
            let ack = Self::kafka_send(&self.producer, &self.topic, &event)?;
            set.spawn(Self::process_ack(ack));
        }

        // Fail the whole batch on the first failed ack
        async move {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        set.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        set.abort_all();
                        error!("join error while waiting on Kafka ACK: {:?}", err);
                        return Err(InputError::RetryableSinkError);
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("ack_wait_many"))
        .await?;

        histogram!("http_input_batch_size").record(batch_size as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::api::InputError;
    use crate::config::KafkaConfig;
    use crate::event::{Entry, Event, Record};
    use crate::sinks::kafka::KafkaSink;
    use crate::sinks::EventSink;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_json::{json, Value};
    use time::Duration;

    async fn start_on_mocked_sink() -> (MockCluster<'static, DefaultProducerContext>, KafkaSink) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka", Duration::seconds(30)).await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_producer_message_max_bytes: 1_000_000,
            kafka_compression_codec: "none".to_string(),
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_topic: "events".to_string(),
            kafka_tls: false,
        };
        let sink = KafkaSink::new(config, handle).expect("failed to create sink");
        (cluster, sink)
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(record) => record,
            _ => panic!("not an object"),
        }
    }

    fn entry(time: u64) -> Entry {
        Entry {
            time,
            record: record(json!({"a": 1})),
        }
    }

    #[tokio::test]
    async fn kafka_sink_error_handling() {
        // Single test to pay the producer startup cost once
        let (cluster, sink) = start_on_mocked_sink().await;
        let event = Event {
            tag: "app.access".to_string(),
            time: 1293973200,
            record: record(json!({"a": 1})),
        };

        // Wait for the producer to be ready, message timeout is short
        for _ in 0..20 {
            if sink.send(event.clone()).await.is_ok() {
                break;
            }
        }

        sink.send(event.clone())
            .await
            .expect("failed to send one initial event");
        sink.send_batch("app.access".to_string(), vec![entry(1), entry(2)])
            .await
            .expect("failed to send initial event batch");

        match sink.send(Event { tag: String::new(), ..event.clone() }).await {
            Err(InputError::EmptyTag) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Twice the configured message.max.bytes
        let big_event = Event {
            record: record(json!({"data": "x".repeat(2_000_000)})),
            ..event.clone()
        };
        match sink.send(big_event).await {
            Err(InputError::EventTooBig) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink.send(event.clone()).await {
            Err(InputError::EventTooBig) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_INVALID_PARTITIONS; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink
            .send_batch("app.access".to_string(), vec![entry(1), entry(2)])
            .await
        {
            Err(InputError::RetryableSinkError) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Transient errors are retried by the producer
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        sink.send(event.clone())
            .await
            .expect("failed to send one event after recovery");

        // Until the message timeout
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 50];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink.send(event.clone()).await {
            Err(InputError::RetryableSinkError) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };
    }
}
