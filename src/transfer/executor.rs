//! Transfer executor
//!
//! Holds what every transfer needs: the store, the shared retry executor and
//! the client settings. Upload and download paths live in their own modules.

use crate::config::ClientConfig;
use crate::core::BoundedRetryExecutor;
use crate::hash::MultipartDigest;
use crate::storage::{ByteStream, ObjectStore};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Moves single objects between local files and the store
#[derive(Clone)]
pub struct TransferExecutor {
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) executor: BoundedRetryExecutor,
    pub(super) config: Arc<ClientConfig>,
}

impl TransferExecutor {
    /// Create an executor sharing `executor`'s concurrency cap
    pub fn new(
        store: Arc<dyn ObjectStore>,
        executor: BoundedRetryExecutor,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn executor(&self) -> &BoundedRetryExecutor {
        &self.executor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Tee<F> {
    body: ByteStream,
    digest: MultipartDigest,
    done: Option<oneshot::Sender<MultipartDigest>>,
    seen: u64,
    on_bytes: F,
}

/// Pass `body` through unchanged while feeding `digest`
///
/// `on_bytes` receives the running byte count of this body. The finished
/// digest is delivered once the body has been read to the end; if the
/// consumer stops early, the receiver sees a closed channel.
pub(crate) fn digesting_body<F>(
    body: ByteStream,
    digest: MultipartDigest,
    on_bytes: F,
) -> (ByteStream, oneshot::Receiver<MultipartDigest>)
where
    F: FnMut(u64) + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tee = Tee {
        body,
        digest,
        done: Some(tx),
        seen: 0,
        on_bytes,
    };
    let stream = stream::unfold(Some(tee), |state| async move {
        let mut tee = state?;
        match tee.body.next().await {
            Some(Ok(chunk)) => {
                tee.digest.update(&chunk);
                tee.seen += chunk.len() as u64;
                (tee.on_bytes)(tee.seen);
                Some((Ok(chunk), Some(tee)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                tee.digest.finish();
                if let Some(done) = tee.done.take() {
                    let _ = done.send(tee.digest);
                }
                None
            }
        }
    });
    (stream.boxed(), rx)
}
