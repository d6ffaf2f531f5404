use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_bridge::config::AppConfig;
use event_bridge::daemons::{DaemonSet, InboundNotifications, OutboundNotifications, ProjectionDaemon};
use event_bridge::domain::contracts::{self, SIGN_UP_REQUESTED};
use event_bridge::domain::session::SignUpRequested;
use event_bridge::domain::{
    user_view_projector, ChangeEmail, EmailSignUp, InMemoryUserViewStore, PostgresUserViewStore, UserView,
    UserViewStore,
};
use event_bridge::event_sourcing::core::StoredEvent;
use event_bridge::event_sourcing::projections::{
    EventHandlerTable, InMemoryOffsetStore, OffsetStore, PostgresOffsetStore,
};
use event_bridge::event_sourcing::publishing::DomainEventsPublisher;
use event_bridge::event_sourcing::store::{
    AggregateRepository, EventStore, InMemoryEventStore, InMemorySnapshotStore, PostgresEventStore,
    PostgresSnapshotStore, SnapshotPolicy, SnapshotStore,
};
use event_bridge::messaging::{
    create_topics, KafkaNotificationConsumer, KafkaNotificationProducer, NotificationConsumer, NotificationHandler,
    NotificationProducer,
};
use event_bridge::metrics::{self, Metrics};
use event_bridge::rpc::{CommandRunner, RetryPolicy};

struct Stores {
    user_events: Arc<dyn EventStore>,
    user_snapshots: Arc<dyn SnapshotStore>,
    session_events: Arc<dyn EventStore>,
    session_snapshots: Arc<dyn SnapshotStore>,
    // View rows and their offsets always share one backend
    view_rows: Arc<dyn UserViewStore>,
    offsets: Arc<dyn OffsetStore>,
}

async fn build_stores(
    config: &AppConfig,
    publisher: &DomainEventsPublisher,
    metrics: &Arc<Metrics>,
) -> anyhow::Result<Stores> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return Ok(Stores {
            user_events: Arc::new(
                InMemoryEventStore::new("user_events", publisher.clone()).with_metrics(metrics.clone()),
            ),
            user_snapshots: Arc::new(InMemorySnapshotStore::new()),
            session_events: Arc::new(
                InMemoryEventStore::new("session_events", publisher.clone()).with_metrics(metrics.clone()),
            ),
            session_snapshots: Arc::new(InMemorySnapshotStore::new()),
            view_rows: Arc::new(InMemoryUserViewStore::new()),
            offsets: Arc::new(InMemoryOffsetStore::new()),
        });
    };

    tracing::info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

    let user_events = PostgresEventStore::new(pool.clone(), "user_events", publisher.clone())?
        .with_metrics(metrics.clone());
    let session_events = PostgresEventStore::new(pool.clone(), "session_events", publisher.clone())?
        .with_metrics(metrics.clone());
    let user_snapshots = PostgresSnapshotStore::new(pool.clone(), "user_snapshots")?;
    let session_snapshots = PostgresSnapshotStore::new(pool.clone(), "session_snapshots")?;
    let view_rows = PostgresUserViewStore::new(pool.clone());
    let offsets = PostgresOffsetStore::new(pool);

    user_events.migrate().await?;
    session_events.migrate().await?;
    user_snapshots.migrate().await?;
    session_snapshots.migrate().await?;
    view_rows.migrate().await?;
    offsets.migrate().await?;
    tracing::info!("✅ Event, snapshot, view and offset tables ready");

    Ok(Stores {
        user_events: Arc::new(user_events),
        user_snapshots: Arc::new(user_snapshots),
        session_events: Arc::new(session_events),
        session_snapshots: Arc::new(session_snapshots),
        view_rows: Arc::new(view_rows),
        offsets: Arc::new(offsets),
    })
}

/// Reads sign-up requests back from the broker. Stands in for a
/// downstream service such as a mailer.
#[derive(Default)]
struct SignUpAudit {
    seen: AtomicU64,
}

impl SignUpAudit {
    async fn on_sign_up_requested(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
        let request: SignUpRequested = serde_json::from_value(event.data)?;
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            session_id = %request.session_id,
            user_id = %request.user_id,
            seen = seen,
            "📬 Sign-up notification received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter, e.g. RUST_LOG=debug
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,event_bridge=debug")))
        .init();

    tracing::info!("🚀 Starting event bridge");

    let config = AppConfig::from_env()?;
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // Metrics server runs on its own thread and actix system
    let metrics_registry = metrics.registry().clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        actix_web::rt::System::new().block_on(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    let publisher = DomainEventsPublisher::new(config.publisher_capacity).with_metrics(metrics.clone());
    let stores = build_stores(&config, &publisher, &metrics).await?;

    // === Broker ===
    let registry = Arc::new(contracts::codec_registry()?);
    match create_topics(&config.kafka, &registry.topics()).await {
        Ok(created) => tracing::info!(created = ?created, "Topics ready"),
        Err(e) => tracing::warn!(error = %e, "Could not create topics, continuing"),
    }

    let producer: Arc<dyn NotificationProducer> = Arc::new(
        KafkaNotificationProducer::new(config.kafka.clone(), registry.clone()).with_metrics(metrics.clone()),
    );
    let consumer: Arc<dyn NotificationConsumer> = Arc::new(
        KafkaNotificationConsumer::new(config.kafka.clone(), registry.clone()).with_metrics(metrics.clone()),
    );

    // === Read side ===
    let view = Arc::new(UserView::new(stores.view_rows.clone()));
    let projector = Arc::new(
        user_view_projector(
            view.clone(),
            stores.offsets.clone(),
            stores.user_events.clone(),
            stores.session_events.clone(),
        )?
        .with_metrics(metrics.clone()),
    );

    let audit = Arc::new(SignUpAudit::default());
    let audit_handler = Arc::new(NotificationHandler::new(
        "sign_up_audit",
        audit.clone(),
        EventHandlerTable::new().on(SIGN_UP_REQUESTED, SignUpAudit::on_sign_up_requested)?,
    )?);

    let daemons = DaemonSet::new()
        .with(Arc::new(ProjectionDaemon::new(projector, publisher.listener())))
        .with(Arc::new(OutboundNotifications::new(producer, publisher.listener())))
        .with(Arc::new(InboundNotifications::new(consumer, audit_handler)));
    daemons.start_all().await?;
    tracing::info!(daemons = ?daemons.names(), "✅ Daemons started");

    // === Write side ===
    let policy = SnapshotPolicy::every(config.snapshot_interval);
    let users = AggregateRepository::new(stores.user_events.clone(), stores.user_snapshots.clone(), policy)
        .with_metrics(metrics.clone());
    let sessions = AggregateRepository::new(stores.session_events.clone(), stores.session_snapshots.clone(), policy)
        .with_metrics(metrics.clone());

    let runner = CommandRunner::new(RetryPolicy::from_config(&config)).with_metrics(metrics.clone());
    let sign_up = EmailSignUp::new(users.clone(), sessions, view.clone());
    let change_email = ChangeEmail::new(users, view.clone());

    match runner
        .handle_command("email_sign_up", |_| sign_up.execute("demo@example.com"))
        .await
    {
        Ok(outcome) => {
            tracing::info!(user_id = %outcome.user_id, session_id = %outcome.session_id, "Demo sign-up done");
            let user_id = outcome.user_id;
            match runner
                .handle_command("change_email", |_| change_email.execute(&user_id, "demo@example.org"))
                .await
            {
                Ok(version) => tracing::info!(user_id = %user_id, version = version, "Demo email change done"),
                Err(status) => tracing::warn!(code = ?status.code(), message = status.message(), "Demo email change failed"),
            }
        }
        Err(status) => tracing::warn!(code = ?status.code(), message = status.message(), "Demo sign-up failed"),
    }

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("🛑 Shutting down...");
    // Outbound daemon flushes the producer on stop
    daemons.stop_all().await;
    match view.len().await {
        Ok(users) => tracing::info!(users = users, "✅ Shutdown complete"),
        Err(e) => tracing::warn!(error = %e, "✅ Shutdown complete, user count unavailable"),
    }

    Ok(())
}
