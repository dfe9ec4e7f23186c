use std::time::Duration;

use common_kafka::kafka_producer::{create_kafka_producer, KafkaContext};
use health::HealthRegistry;
use rdkafka::producer::FutureProducer;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::Error;

pub struct AppContext {
    pub pool: PgPool,
    pub producer: FutureProducer<KafkaContext>,
    pub liveness: HealthRegistry,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;

        let liveness = HealthRegistry::new("liveness");
        let kafka_liveness = liveness
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;
        let producer = create_kafka_producer(&config.kafka, kafka_liveness).await?;

        Ok(Self {
            pool,
            producer,
            liveness,
        })
    }
}
