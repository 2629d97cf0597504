use crate::config::HttpConfig;
use crate::error::FetchError;
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
pub(crate) mod scripted;

/// A streaming GET. `on_chunk` sees the length of every received data frame in order;
/// returning `false` aborts the transfer with [`FetchError::ChunkRejected`]. Dropping the
/// returned future cancels the request.
pub trait Fetch: Send + Sync + 'static {
    fn fetch<F>(&self, uri: Uri, on_chunk: F) -> impl Future<Output = Result<(), FetchError>> + Send
    where
        F: FnMut(usize) -> bool + Send;
}

/// Plain-HTTP client backed by hyper's pooled connector.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

impl Fetch for HttpFetcher {
    async fn fetch<F>(&self, uri: Uri, mut on_chunk: F) -> Result<(), FetchError>
    where
        F: FnMut(usize) -> bool + Send,
    {
        let request = Request::get(uri).body(Empty::<Bytes>::new())?;
        let mut response = self.client.request(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let body = response.body_mut();
        while let Some(frame) = body.frame().await {
            let frame = frame?;
            if let Some(data) = frame.data_ref() {
                if !on_chunk(data.len()) {
                    debug!("Chunk rejected, dropping response");
                    return Err(FetchError::ChunkRejected);
                }
            }
        }

        Ok(())
    }
}

/// Builds the URL of one attempt: `<base>?ckSize=<n>&r=<nonce>&cors=1`, using `&` when the
/// base URL already has a query string.
pub fn attempt_uri(base: &Uri, ck_size: u32, nonce: f64) -> Result<Uri, FetchError> {
    let base = base.to_string();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}ckSize={ck_size}&r={nonce}&cors=1")
        .parse()
        .map_err(|e: http::uri::InvalidUri| FetchError::Transport(e.to_string()))
}
