use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    auth::session::{Collaborators, SessionManager},
    cache::{MemoryCache, RedisCache},
    config::AppConfig,
    notify::{ChannelPublisher, LogMailer, LogPublisher, NotificationWorker},
    storage::{MemoryStorage, S3Storage},
    store::{MemoryStore, PgStore},
};

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Connect every backend, run migrations and start the notification worker.
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to postgres")?;

        if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
            warn!(error = %e, "migration failed; continuing");
        }

        let cache = RedisCache::connect(&config.redis_url).await?;
        let storage = S3Storage::new(&config.storage).await?;
        let (publisher, events) = ChannelPublisher::new(EVENT_QUEUE_CAPACITY);

        let sessions = Arc::new(SessionManager::new(
            &config,
            Collaborators {
                store: Arc::new(PgStore::new(db)),
                cache: Arc::new(cache),
                publisher: Arc::new(publisher),
                storage: Arc::new(storage),
            },
        ));

        let worker =
            NotificationWorker::new(sessions.clone(), Arc::new(LogMailer), &config.public_url);
        tokio::spawn(worker.run(events));
        info!("notification worker started");

        Ok(Self { sessions })
    }

    /// Fully in-memory state for tests and local experiments.
    pub fn fake() -> Self {
        let sessions = Arc::new(SessionManager::new(
            &AppConfig::for_tests(),
            Collaborators {
                store: Arc::new(MemoryStore::new()),
                cache: Arc::new(MemoryCache::new()),
                publisher: Arc::new(LogPublisher),
                storage: Arc::new(MemoryStorage::new()),
            },
        ));
        Self { sessions }
    }
}
