use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task;
use unitwork_core::{
    atomic_async, run_atomic_async, AsyncConnection, AsyncSessionHandle, AsyncSessionRegistry,
    AsyncSqliteConnection, AsyncSqliteConnector, AtomicError, DriverError, DriverOp, Entity,
    EntityRepository, SessionConfig, SqliteEntityRepository, WorkError,
};

type Registry = AsyncSessionRegistry<AsyncSqliteConnector>;
type Handle = AsyncSessionHandle<AsyncSqliteConnection>;

fn registry() -> (TempDir, Registry) {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::file(dir.path().join("unitwork.db"));
    let registry = AsyncSessionRegistry::new(AsyncSqliteConnector::new(config).unwrap());
    (dir, registry)
}

/// Id of a finished task; its handle is driven from the test task.
async fn foreign_scope() -> task::Id {
    tokio::spawn(async { task::id() }).await.unwrap()
}

async fn insert(session: &Handle, description: &str) -> Result<(), WorkError> {
    let entity = Entity::new(description);
    session
        .connection()
        .await?
        .call(move |raw| {
            SqliteEntityRepository::new(raw).create_entity(&entity)?;
            Ok::<_, WorkError>(())
        })
        .await
}

async fn read_descriptions(session: Arc<Handle>) -> Result<Vec<String>, WorkError> {
    session
        .connection()
        .await?
        .call(|raw| {
            let mut stmt = raw.prepare("SELECT description FROM entities ORDER BY description;")?;
            let values = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, WorkError>(values)
        })
        .await
}

async fn descriptions(registry: &Registry) -> Vec<String> {
    atomic_async(registry, read_descriptions).await.unwrap()
}

#[tokio::test]
async fn commit_rollback_and_reuse_within_one_task() {
    tokio::spawn(async {
        let (_dir, registry) = registry();

        atomic_async(&registry, |session| async move { insert(&session, "V1").await })
            .await
            .unwrap();
        assert_eq!(descriptions(&registry).await, ["V1"]);

        let err = atomic_async(&registry, |session| async move {
            insert(&session, "V2").await?;
            Err::<(), _>(WorkError::application("value must be positive"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AtomicError::Internal(_)));
        assert_eq!(descriptions(&registry).await, ["V1"]);

        atomic_async(&registry, |session| async move { insert(&session, "V3").await })
            .await
            .unwrap();
        assert_eq!(descriptions(&registry).await, ["V1", "V3"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn caught_inner_failure_keeps_outer_writes() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let nested = registry.clone();

        atomic_async(&registry, move |session| async move {
            insert(&session, "E1").await?;
            let inner = atomic_async(&nested, |session| async move {
                insert(&session, "E2").await?;
                Err::<(), _>(WorkError::application("inner failure"))
            })
            .await;
            assert!(matches!(inner, Err(AtomicError::Internal(_))));
            assert_eq!(session.depth(), 1);
            insert(&session, "E4").await
        })
        .await
        .unwrap();

        assert_eq!(descriptions(&registry).await, ["E1", "E4"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn serialization_failure_surfaces_as_aborted() {
    tokio::spawn(async {
        let (_dir, registry) = registry();

        let err = atomic_async(&registry, |session| async move {
            insert(&session, "V3").await?;
            Err::<(), _>(
                DriverError::new(DriverOp::Execute, "could not serialize access")
                    .with_sqlstate("40001")
                    .into(),
            )
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AtomicError::Aborted(_)));
        assert!(descriptions(&registry).await.is_empty());

        atomic_async(&registry, |session| async move { insert(&session, "V4").await })
            .await
            .unwrap();
        assert_eq!(descriptions(&registry).await, ["V4"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn timed_out_inner_block_is_rolled_back_and_outer_commits() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let nested = registry.clone();

        atomic_async(&registry, move |session| async move {
            insert(&session, "A").await?;
            let timed_out = tokio::time::timeout(
                Duration::from_millis(50),
                atomic_async(&nested, |session| async move {
                    insert(&session, "B").await?;
                    std::future::pending::<()>().await;
                    Ok::<_, WorkError>(())
                }),
            )
            .await;
            assert!(timed_out.is_err());
            assert_eq!(session.depth(), 1);
            assert!(session.has_pending_unwind());

            insert(&session, "C").await?;
            assert!(!session.has_pending_unwind());
            Ok::<_, WorkError>(())
        })
        .await
        .unwrap();

        assert_eq!(descriptions(&registry).await, ["A", "C"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn dropped_root_block_leaves_a_reusable_session() {
    tokio::spawn(async {
        let (_dir, registry) = registry();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            atomic_async(&registry, |session| async move {
                insert(&session, "abandoned").await?;
                std::future::pending::<()>().await;
                Ok::<_, WorkError>(())
            }),
        )
        .await;
        assert!(timed_out.is_err());

        let handle = registry.get_or_create_current().await.unwrap();
        assert_eq!(handle.depth(), 0);
        assert!(handle.is_valid());

        atomic_async(&registry, |session| async move { insert(&session, "next").await })
            .await
            .unwrap();
        assert_eq!(descriptions(&registry).await, ["next"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn uncommitted_writes_stay_invisible_to_other_tasks() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let writer = foreign_scope().await;
        let reader = foreign_scope().await;
        let nested = registry.clone();

        run_atomic_async(&registry, writer, move |session| async move {
            insert(&session, "pending").await?;
            let seen = run_atomic_async(&nested, reader, read_descriptions).await?;
            assert!(seen.is_empty());
            Ok::<_, WorkError>(())
        })
        .await
        .unwrap();

        let seen = run_atomic_async(&registry, reader, read_descriptions)
            .await
            .unwrap();
        assert_eq!(seen, ["pending"]);
        assert!(registry.is_empty());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stale_wal_snapshot_surfaces_as_aborted() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let other = foreign_scope().await;
        let nested = registry.clone();

        let err = atomic_async(&registry, move |session| async move {
            read_descriptions(Arc::clone(&session)).await?;
            run_atomic_async(&nested, other, |session| async move {
                insert(&session, "winner").await
            })
            .await?;
            insert(&session, "loser").await
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AtomicError::Aborted(_)));
        assert_eq!(descriptions(&registry).await, ["winner"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn invalidated_session_surfaces_connection_error() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        registry.get_or_create_current().await.unwrap().invalidate();

        let err = atomic_async(&registry, |session| async move { insert(&session, "x").await })
            .await
            .unwrap_err();
        assert!(matches!(err, AtomicError::Connection { .. }));

        assert!(registry.remove_current().await);
        atomic_async(&registry, |session| async move { insert(&session, "y").await })
            .await
            .unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn scoped_task_releases_its_session() {
    let (_dir, registry) = registry();
    let worker = registry.clone();

    tokio::spawn(async move {
        let inner = worker.clone();
        worker
            .scoped(async move {
                atomic_async(&inner, |session| async move { insert(&session, "scoped").await })
                    .await
                    .unwrap();
                assert_eq!(inner.len(), 1);
            })
            .await;
    })
    .await
    .unwrap();

    assert!(registry.is_empty());
}

#[tokio::test]
async fn top_level_block_releases_the_session_it_opened() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let nested = registry.clone();

        atomic_async(&registry, move |session| async move {
            insert(&session, "outer").await?;
            atomic_async(&nested, |session| async move { insert(&session, "inner").await })
                .await?;
            assert_eq!(nested.len(), 1);
            Ok::<_, WorkError>(())
        })
        .await
        .unwrap();
        assert!(registry.is_empty());

        let held = registry.get_or_create_current().await.unwrap();
        atomic_async(&registry, |session| async move { insert(&session, "kept").await })
            .await
            .unwrap();
        let bound = registry.get_or_create_current().await.unwrap();
        assert_eq!(bound.session_id(), held.session_id());
        assert!(registry.remove_current().await);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn blocks_inside_scoped_share_one_session() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let inner = registry.clone();

        registry
            .scoped(async move {
                let first = atomic_async(&inner, |session| async move {
                    insert(&session, "first").await?;
                    Ok::<_, WorkError>(session.session_id())
                })
                .await
                .unwrap();
                let second = atomic_async(&inner, |session| async move {
                    insert(&session, "second").await?;
                    Ok::<_, WorkError>(session.session_id())
                })
                .await
                .unwrap();
                assert_eq!(first, second);
                assert_eq!(inner.len(), 1);
            })
            .await;

        assert!(registry.is_empty());
        assert_eq!(descriptions(&registry).await, ["first", "second"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn closed_connection_surfaces_as_connection_error() {
    tokio::spawn(async {
        let (_dir, registry) = registry();
        let held = registry.get_or_create_current().await.unwrap();

        let err = atomic_async(&registry, |session| async move {
            insert(&session, "lost").await?;
            session.connection().await?.close().await?;
            Ok::<_, WorkError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AtomicError::Connection { .. }));
        assert!(!held.is_valid());

        let err = atomic_async(&registry, |_| async { Ok::<_, WorkError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATABASE_CONNECTION_ERROR");

        assert!(registry.remove_current().await);
        assert!(descriptions(&registry).await.is_empty());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn outside_a_task_the_scope_is_unavailable() {
    let (_dir, registry) = registry();

    let err = atomic_async(&registry, |session| async move { insert(&session, "x").await })
        .await
        .unwrap_err();

    assert!(matches!(err, AtomicError::ScopeUnavailable));
    assert_eq!(err.code(), "SCOPE_UNAVAILABLE");
    assert!(registry.is_empty());
}
