use sqlx::{Connection, PgPool, Postgres, pool::PoolConnection};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Advisory lock key for leadership ("FOXDLEAD").
pub const LEADER_LOCK_ID: i64 = 0x464F_5844_4C45_4144;

/// Background task for leader election.
///
/// The leader runs the ingest and recurring task schedulers. PostgreSQL advisory locks are
/// session based, so the lock is held on a dedicated connection for as long as we lead and a
/// periodic `SELECT 1` notices when that connection dies.
///
/// On shutdown the lock connection is closed rather than returned to the pool, so the lock is
/// released for the other instances straight away.
#[instrument(skip(pool, is_leader, shutdown, on_gain_leadership, on_lose_leadership))]
pub async fn leader_election_task<F1, F2, Fut1, Fut2>(
    pool: PgPool,
    lock_id: i64,
    check_interval: Duration,
    is_leader: Arc<AtomicBool>,
    shutdown: CancellationToken,
    on_gain_leadership: F1,
    on_lose_leadership: F2,
) where
    F1: Fn() -> Fut1 + Send + 'static,
    F2: Fn() -> Fut2 + Send + 'static,
    Fut1: Future<Output = anyhow::Result<()>> + Send + 'static,
    Fut2: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut interval = tokio::time::interval(check_interval);
    let mut leader_conn: Option<PoolConnection<Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match leader_conn.as_mut() {
            None => match pool.acquire().await {
                Ok(mut conn) => {
                    match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                        .bind(lock_id)
                        .fetch_one(&mut *conn)
                        .await
                    {
                        Ok(true) => {
                            info!("Gained leadership");
                            is_leader.store(true, Ordering::Relaxed);
                            leader_conn = Some(conn);

                            if let Err(e) = on_gain_leadership().await {
                                error!(error = %e, "Failed to start leader services");
                            }
                        }
                        Ok(false) => debug!("Following, will retry"),
                        Err(e) => error!(error = %e, "Failed to check leader lock"),
                    }
                }
                Err(e) => error!(error = %e, "Failed to acquire connection for leader election"),
            },
            Some(conn) => {
                if let Err(e) = sqlx::query("SELECT 1").execute(&mut **conn).await {
                    // The lock went with the connection
                    warn!(error = %e, "Lost leadership (connection died)");
                    is_leader.store(false, Ordering::Relaxed);
                    leader_conn = None;

                    if let Err(e) = on_lose_leadership().await {
                        error!(error = %e, "Failed to stop leader services");
                    }
                } else {
                    debug!("Leadership renewed");
                }
            }
        }
    }

    if let Some(conn) = leader_conn.take() {
        if let Err(e) = conn.detach().close().await {
            warn!(error = %e, "Failed to close leader connection");
        }
        is_leader.store(false, Ordering::Relaxed);
        if let Err(e) = on_lose_leadership().await {
            error!(error = %e, "Failed to stop leader services on shutdown");
        }
    }
    info!("Leader election stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spawn_candidate(
        pool: &PgPool,
        shutdown: &CancellationToken,
        gained: Arc<AtomicUsize>,
        lost: Arc<AtomicUsize>,
    ) -> (Arc<AtomicBool>, tokio::task::JoinHandle<()>) {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(leader_election_task(
            pool.clone(),
            4242,
            Duration::from_millis(20),
            flag.clone(),
            shutdown.clone(),
            move || {
                let gained = gained.clone();
                async move {
                    gained.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            move || {
                let lost = lost.clone();
                async move {
                    lost.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));
        (flag, handle)
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_only_one_leader_and_handover(pool: PgPool) {
        let gained = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));

        let first_shutdown = CancellationToken::new();
        let (first, first_handle) = spawn_candidate(&pool, &first_shutdown, gained.clone(), lost.clone());
        for _ in 0..50 {
            if first.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(first.load(Ordering::SeqCst));

        let second_shutdown = CancellationToken::new();
        let (second, second_handle) = spawn_candidate(&pool, &second_shutdown, gained.clone(), lost.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!second.load(Ordering::SeqCst));
        assert_eq!(gained.load(Ordering::SeqCst), 1);

        first_shutdown.cancel();
        first_handle.await.unwrap();
        assert!(!first.load(Ordering::SeqCst));
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        for _ in 0..50 {
            if second.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(second.load(Ordering::SeqCst));
        assert_eq!(gained.load(Ordering::SeqCst), 2);

        second_shutdown.cancel();
        second_handle.await.unwrap();
    }
}
