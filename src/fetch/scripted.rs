use super::Fetch;
use crate::error::FetchError;
use http::{StatusCode, Uri};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What every request made through a [`ScriptedFetcher`] does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// `chunks` chunks of `chunk_len` bytes, one every `interval`, then success.
    Stream {
        chunk_len: usize,
        chunks: usize,
        interval: Duration,
    },
    /// Fails with a 503 after `delay`.
    Fail { delay: Duration },
    /// Delivers one chunk, then never completes.
    Hang { chunk_len: usize },
    /// Delivers a zero-length chunk.
    EmptyChunk,
}

pub(crate) struct ScriptedFetcher {
    script: Script,
    calls: AtomicUsize,
    uris: Mutex<Vec<Uri>>,
}

impl ScriptedFetcher {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            uris: Mutex::new(Vec::new()),
        }
    }

    /// Endless stream of `chunk_len` byte chunks every `interval`.
    pub(crate) fn steady(chunk_len: usize, interval: Duration) -> Self {
        Self::new(Script::Stream {
            chunk_len,
            chunks: usize::MAX,
            interval,
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn uris(&self) -> Vec<Uri> {
        self.uris.lock().unwrap().clone()
    }
}

impl Fetch for ScriptedFetcher {
    async fn fetch<F>(&self, uri: Uri, mut on_chunk: F) -> Result<(), FetchError>
    where
        F: FnMut(usize) -> bool + Send,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uris.lock().unwrap().push(uri);

        match self.script {
            Script::Stream {
                chunk_len,
                chunks,
                interval,
            } => {
                for _ in 0..chunks {
                    tokio::time::sleep(interval).await;
                    if !on_chunk(chunk_len) {
                        return Err(FetchError::ChunkRejected);
                    }
                }
                Ok(())
            }
            Script::Fail { delay } => {
                tokio::time::sleep(delay).await;
                Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE))
            }
            Script::Hang { chunk_len } => {
                on_chunk(chunk_len);
                std::future::pending().await
            }
            Script::EmptyChunk => {
                if on_chunk(0) {
                    Ok(())
                } else {
                    Err(FetchError::ChunkRejected)
                }
            }
        }
    }
}
