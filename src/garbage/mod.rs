use anyhow::Result;
use futures::stream;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rand::Rng;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Chunks served when the request has no usable `ckSize`.
pub const DEFAULT_CHUNKS: u32 = 4;
/// Upper bound on `ckSize`.
pub const MAX_CHUNKS: u32 = 1024;
/// Size of one garbage chunk.
pub const MIB: usize = 1024 * 1024;

type GarbageBody = BoxBody<Bytes, Infallible>;

/// Answers `GET <any path>?ckSize=N` with `N` chunks of incompressible random bytes.
/// `GET /fail` always answers 500.
pub struct GarbageServer {
    listener: TcpListener,
    chunk: Bytes,
}

impl GarbageServer {
    pub async fn bind(addr: SocketAddr, chunk_len: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let mut chunk = vec![0u8; chunk_len];
        rand::rng().fill(&mut chunk[..]);

        Ok(Self {
            listener,
            chunk: Bytes::from(chunk),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("Serving garbage on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((socket, client_addr)) => {
                    debug!("New connection from {}", client_addr);
                    let chunk = self.chunk.clone();
                    let io = TokioIo::new(socket);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle(req, chunk.clone()));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            // clients abort transfers when a test ends
                            debug!("Connection from {} ended: {}", client_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle(req: Request<Incoming>, chunk: Bytes) -> Result<Response<GarbageBody>, Infallible> {
    if req.uri().path() == "/fail" {
        return Ok(empty(StatusCode::INTERNAL_SERVER_ERROR));
    }
    if req.method() != Method::GET {
        return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
    }

    let chunks = requested_chunks(req.uri().query());
    debug!("Sending {} chunks of {} bytes", chunks, chunk.len());

    let frames = stream::iter((0..chunks).map(move |_| Ok::<_, Infallible>(Frame::data(chunk.clone()))));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0")
        .body(StreamBody::new(frames).boxed())
        .unwrap_or_else(|_| empty(StatusCode::INTERNAL_SERVER_ERROR));
    Ok(response)
}

fn empty(status: StatusCode) -> Response<GarbageBody> {
    let mut response = Response::new(Empty::<Bytes>::new().boxed());
    *response.status_mut() = status;
    response
}

/// `ckSize` from the query string, clamped to `1..=MAX_CHUNKS`.
///
/// Pairs are matched literally: percent-encoded keys or values are not decoded, so
/// `ck%53ize=7` or `ckSize=%37` fall back to [`DEFAULT_CHUNKS`]. The engine never
/// encodes this parameter.
pub fn requested_chunks(query: Option<&str>) -> u32 {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "ckSize")
        .and_then(|(_, value)| value.parse::<u32>().ok())
        .map(|n| n.clamp(1, MAX_CHUNKS))
        .unwrap_or(DEFAULT_CHUNKS)
}
