//! Query batching
//!
//! Two paths share `batch_size`:
//! - [`QueryOptimizer::batch_queries`] runs a caller-supplied group in
//!   priority order, chunk by chunk, and fails as soon as one query fails.
//! - [`QueryOptimizer::add_to_batch`] enqueues into a queue shared by all
//!   callers. Each item settles on its own; a failing item never affects
//!   its siblings.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, try_join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::optimizer::{OptimizerInner, QueryOptimizer};
use crate::error::{Error, Result};

/// One member of a fail-fast batch
pub struct BatchedQuery {
    pub id: String,
    pub query: BoxFuture<'static, Result<Value>>,
    /// Higher runs earlier
    pub priority: i32,
}

impl BatchedQuery {
    pub fn new<F>(id: impl Into<String>, query: F, priority: i32) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            query: Box::pin(query),
            priority,
        }
    }
}

pub(crate) struct PendingQuery {
    id: String,
    query: BoxFuture<'static, Result<Value>>,
    priority: i32,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<Value>>,
}

/// Shared `add_to_batch` queue
#[derive(Default)]
pub(crate) struct BatchQueue {
    pub(crate) pending: Vec<PendingQuery>,
    /// Cancels the outstanding flush timer
    pub(crate) timer: Option<CancellationToken>,
}

impl BatchQueue {
    /// Take every queued item and disarm the timer
    pub(crate) fn drain(&mut self) -> Vec<PendingQuery> {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        std::mem::take(&mut self.pending)
    }
}

impl QueryOptimizer {
    /// Run `queries` highest priority first, `batch_size` at a time.
    ///
    /// Results come back in execution order. The first failure aborts the
    /// call as [`Error::BatchQueryFailed`]; later chunks never start.
    pub async fn batch_queries(&self, queries: Vec<BatchedQuery>) -> Result<Vec<(String, Value)>> {
        let mut queries = queries;
        // Stable, so equal priorities keep submission order
        queries.sort_by(|a, b| b.priority.cmp(&a.priority));

        let batch_size = self.inner.config.batch_size.max(1);
        let mut results = Vec::with_capacity(queries.len());
        let mut remaining = queries.into_iter();

        loop {
            let chunk: Vec<BatchedQuery> = remaining.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            debug!(size = chunk.len(), "running query batch");

            let settled = try_join_all(chunk.into_iter().map(|q| async move {
                let BatchedQuery { id, query, .. } = q;
                match query.await {
                    Ok(value) => Ok((id, value)),
                    Err(e) => Err(Error::BatchQueryFailed {
                        id,
                        reason: e.to_string(),
                    }),
                }
            }))
            .await?;
            results.extend(settled);
        }

        Ok(results)
    }

    /// Enqueue `query` on the shared batch and wait for its own result.
    ///
    /// The queue flushes when it reaches `batch_size` or `batch_timeout`
    /// after the first queued item, whichever comes first. Items queued
    /// after [`QueryOptimizer::destroy`] fail with [`Error::BatchCancelled`].
    pub async fn add_to_batch<F>(&self, query: F, priority: i32) -> Result<Value>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::BatchCancelled(id));
        }

        let (responder, receiver) = oneshot::channel();
        let flush_now = {
            let mut queue = self.inner.batch_queue.lock();
            queue.pending.push(PendingQuery {
                id: id.clone(),
                query: Box::pin(query),
                priority,
                enqueued_at: Instant::now(),
                responder,
            });

            if queue.pending.len() >= self.inner.config.batch_size.max(1) {
                true
            } else {
                if queue.timer.is_none() {
                    queue.timer = Some(arm_batch_timer(&self.inner));
                }
                false
            }
        };

        if flush_now {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { flush_batch(&inner).await });
        }

        receiver
            .await
            .unwrap_or_else(|_| Err(Error::BatchCancelled(id)))
    }

    /// Items waiting in the shared queue
    pub fn pending_batch_len(&self) -> usize {
        self.inner.batch_queue.lock().pending.len()
    }
}

/// Spawn a flush after `batch_timeout`. Cancelled by the returned token,
/// by any flush that drains the queue first, or by shutdown.
fn arm_batch_timer(inner: &Arc<OptimizerInner>) -> CancellationToken {
    let timer = inner.shutdown.child_token();
    let cancelled = timer.clone();
    let inner = Arc::clone(inner);
    let delay = inner.config.batch_timeout;

    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            _ = tokio::time::sleep(delay) => flush_batch(&inner).await,
        }
    });

    timer
}

async fn flush_batch(inner: &Arc<OptimizerInner>) {
    let mut batch = inner.batch_queue.lock().drain();
    if batch.is_empty() {
        return;
    }

    batch.sort_by(|a, b| b.priority.cmp(&a.priority));
    debug!(size = batch.len(), "flushing query batch");

    // One task per item, so a panicking query only fails its own caller
    let settled = batch.into_iter().map(|pending| {
        let PendingQuery {
            id,
            query,
            priority,
            enqueued_at,
            responder,
        } = pending;
        let task = tokio::spawn(query);

        async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(id = %id, error = %e, "batched query aborted");
                    Err(Error::Internal(format!("batched query {} aborted: {}", id, e)))
                }
            };
            if let Err(e) = &result {
                warn!(id = %id, error = %e, "batched query failed");
            }
            trace!(
                id = %id,
                priority,
                waited_ms = enqueued_at.elapsed().as_millis() as u64,
                "batched query settled"
            );
            // The caller may have given up waiting
            let _ = responder.send(result);
        }
    });
    join_all(settled).await;

    let mut queue = inner.batch_queue.lock();
    if !queue.pending.is_empty() && queue.timer.is_none() && !inner.shutdown.is_cancelled() {
        queue.timer = Some(arm_batch_timer(inner));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::executor::InMemoryExecutor;
    use crate::query::optimizer::QueryOptimizerConfig;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn optimizer(batch_size: usize, batch_timeout: Duration) -> QueryOptimizer {
        QueryOptimizer::new(
            Arc::new(InMemoryExecutor::new()),
            QueryOptimizerConfig {
                batch_size,
                batch_timeout,
                ..Default::default()
            },
        )
    }

    // =========================================================================
    // batch_queries
    // =========================================================================

    #[tokio::test]
    async fn test_batch_queries_priority_order() {
        let optimizer = optimizer(2, Duration::from_millis(50));
        let queries = vec![
            BatchedQuery::new("low", async { Ok(json!(1)) }, 1),
            BatchedQuery::new("high", async { Ok(json!(3)) }, 10),
            BatchedQuery::new("mid", async { Ok(json!(2)) }, 5),
        ];

        let results = optimizer.batch_queries(queries).await.unwrap();

        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
        assert_eq!(results[0].1, json!(3));
    }

    #[tokio::test]
    async fn test_batch_queries_chunks_run_back_to_back() {
        let optimizer = optimizer(2, Duration::from_millis(50));
        let started = Arc::new(Mutex::new(Vec::new()));

        let queries = (0..4)
            .map(|i| {
                let started = started.clone();
                BatchedQuery::new(
                    format!("q{}", i),
                    async move {
                        started.lock().push(Instant::now());
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!(i))
                    },
                    0,
                )
            })
            .collect();

        optimizer.batch_queries(queries).await.unwrap();

        let started = started.lock();
        assert_eq!(started.len(), 4);
        // Second chunk waits for the first
        assert!(started[2].duration_since(started[0]) >= Duration::from_millis(30));
        assert!(started[1].duration_since(started[0]) < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_batch_queries_fail_fast() {
        let optimizer = optimizer(2, Duration::from_millis(50));
        let later_ran = Arc::new(Mutex::new(false));
        let flag = later_ran.clone();

        let queries = vec![
            BatchedQuery::new("ok", async { Ok(json!(1)) }, 2),
            BatchedQuery::new("bad", async { Err(Error::QueryFailed("boom".into())) }, 1),
            BatchedQuery::new(
                "later",
                async move {
                    *flag.lock() = true;
                    Ok(json!(3))
                },
                0,
            ),
        ];

        let err = optimizer.batch_queries(queries).await.unwrap_err();

        assert_matches!(err, Error::BatchQueryFailed { ref id, .. } if id == "bad");
        assert!(!*later_ran.lock());
    }

    #[tokio::test]
    async fn test_batch_queries_empty() {
        let optimizer = optimizer(2, Duration::from_millis(50));
        assert!(optimizer.batch_queries(Vec::new()).await.unwrap().is_empty());
    }

    // =========================================================================
    // add_to_batch
    // =========================================================================

    #[tokio::test]
    async fn test_add_to_batch_isolates_failures() {
        let optimizer = optimizer(3, Duration::from_millis(50));

        let (a, b, c) = tokio::join!(
            optimizer.add_to_batch(async { Ok(json!("a")) }, 0),
            optimizer.add_to_batch(async { Err(Error::QueryFailed("b".into())) }, 0),
            optimizer.add_to_batch(async { Ok(json!("c")) }, 0),
        );

        assert_eq!(a.unwrap(), json!("a"));
        assert_matches!(b, Err(Error::QueryFailed(_)));
        assert_eq!(c.unwrap(), json!("c"));
    }

    #[tokio::test]
    async fn test_add_to_batch_flushes_on_timeout() {
        let optimizer = optimizer(10, Duration::from_millis(20));
        let start = Instant::now();

        let value = optimizer
            .add_to_batch(async { Ok(json!(1)) }, 0)
            .await
            .unwrap();

        assert_eq!(value, json!(1));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(optimizer.pending_batch_len(), 0);
    }

    #[tokio::test]
    async fn test_add_to_batch_flushes_when_full() {
        let optimizer = optimizer(2, Duration::from_secs(60));

        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(
                optimizer.add_to_batch(async { Ok(json!(1)) }, 0),
                optimizer.add_to_batch(async { Ok(json!(2)) }, 0),
            )
        })
        .await
        .expect("full batch should flush without the timer");

        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_size_flush_disarms_pending_timer() {
        let timeout = Duration::from_millis(200);
        let optimizer = optimizer(2, timeout);

        let (a, b) = tokio::join!(
            optimizer.add_to_batch(async { Ok(json!(1)) }, 0),
            optimizer.add_to_batch(async { Ok(json!(2)) }, 0),
        );
        assert!(a.is_ok() && b.is_ok());

        // The first item's timer would have fired 50ms after this point
        tokio::time::sleep(Duration::from_millis(150)).await;
        let start = Instant::now();
        let lone = optimizer
            .add_to_batch(async { Ok(json!(3)) }, 0)
            .await
            .unwrap();

        assert_eq!(lone, json!(3));
        assert!(start.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn test_panicking_item_fails_alone() {
        let optimizer = optimizer(2, Duration::from_secs(60));

        let (bad, good) = tokio::join!(
            optimizer.add_to_batch(
                async {
                    let explode = true;
                    if explode {
                        panic!("query blew up");
                    }
                    Ok(json!("never"))
                },
                1,
            ),
            optimizer.add_to_batch(async { Ok(json!("fine")) }, 0),
        );

        assert_matches!(bad, Err(Error::Internal(_)));
        assert_eq!(good.unwrap(), json!("fine"));
    }

    #[tokio::test]
    async fn test_add_to_batch_runs_by_priority() {
        let optimizer = optimizer(3, Duration::from_millis(20));
        let order = Arc::new(Mutex::new(Vec::new()));

        let item = |name: &'static str| {
            let order = order.clone();
            async move {
                order.lock().push(name);
                Ok(json!(name))
            }
        };

        let (_, _, _) = tokio::join!(
            optimizer.add_to_batch(item("low"), 1),
            optimizer.add_to_batch(item("high"), 9),
            optimizer.add_to_batch(item("mid"), 5),
        );

        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_items_added_during_flush_get_new_timer() {
        let optimizer = optimizer(10, Duration::from_millis(20));
        let follow_up = optimizer.clone();

        let first = optimizer.add_to_batch(
            async move {
                // Enqueued while the first flush is running
                let handle = tokio::spawn(async move {
                    follow_up.add_to_batch(async { Ok(json!("second")) }, 0).await
                });
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!(handle.await.is_ok()))
            },
            0,
        );

        let result = tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .expect("follow-up item should be flushed by a re-armed timer");
        assert_eq!(result.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_destroy_cancels_pending_items() {
        let optimizer = optimizer(10, Duration::from_secs(60));
        let waiting = {
            let optimizer = optimizer.clone();
            tokio::spawn(async move { optimizer.add_to_batch(async { Ok(json!(1)) }, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(optimizer.pending_batch_len(), 1);

        optimizer.destroy();

        assert_matches!(waiting.await.unwrap(), Err(Error::BatchCancelled(_)));
        assert_matches!(
            optimizer.add_to_batch(async { Ok(json!(2)) }, 0).await,
            Err(Error::BatchCancelled(_))
        );
    }
}
