//! The per-connection service state machine.
//!
//! One iteration serves one request: wait for the first byte (service pool
//! and read timeout on a cold connection, keep-alive pool and keep-alive
//! timeout on a persistent one), parse under the service admission, run the
//! application pipeline while pumping the request body, finalize and write
//! the response, then decide the connection's fate: close on the closer
//! pool, persist into the next iteration, or hand the socket to the upgrade
//! pool.
//!
//! Every failure path ends in exactly one wire write or one quiet close;
//! errors during the write itself are only logged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use http::{HeaderValue, Response, StatusCode, header};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use crate::app::Application;
use crate::codec::ContentCoding;
use crate::codec::body::compress;
use crate::codec::header::ends_in_chunked;
use crate::connection::manager::{self, ConnectionDecision};
use crate::connection::{BodyPump, Connection};
use crate::protocol::attributes::{Correlate, OriginRequest, PeerAddr, RequestCount, ServerHandle, UpgradeFn};
use crate::protocol::{Entity, Flow, HttpResponse, PayloadSize, ResponseHead, SendError, is_abort};
use crate::server::socket::{PrefixedIo, ServerStream};
use crate::server::{DateService, ServerInner};

/// The fate of a connection after one service iteration.
enum Fate {
    Close,
    Persist,
    Upgrade(UpgradeFn),
}

pub(crate) async fn accept_loop<A>(inner: Arc<ServerInner<A>>, listener: TcpListener, handle: ServerHandle)
where
    A: Application + Send + Sync + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(server = inner.id, cause = %e, "failed to accept");
                continue;
            }
        };

        let connection_id = inner.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(server = inner.id, connection_id, %peer, "accepted connection");

        let task_inner = Arc::clone(&inner);
        let task_handle = handle.clone();
        inner.executors.spawn_unpooled(async move {
            let _ = stream.set_nodelay(true);
            // transport (e.g. TLS) failures close the connection, logged only
            let io = match task_inner.factory.handshake(stream).await {
                Ok(io) => io,
                Err(e) => {
                    warn!(connection_id, cause = %e, "socket handshake failed");
                    return;
                }
            };
            serve_connection(task_inner, task_handle, io, connection_id, peer).await;
        });
    }

    drop(listener);
    info!(server = inner.id, "accept loop stopped");
    inner.complete_close(&handle);
}

async fn serve_connection<A>(
    inner: Arc<ServerInner<A>>,
    handle: ServerHandle,
    io: ServerStream,
    connection_id: u64,
    peer: SocketAddr,
) where
    A: Application + Send + Sync + 'static,
{
    let config = inner.config.clone();
    let mut conn = Connection::new(io, config.buffer_size, config.header_limit);
    let mut request_count: u32 = 1;

    loop {
        // step 1: first byte, on the service pool for a cold connection, on
        // the keep-alive pool while the connection is idle between requests
        let admission = if request_count == 1 {
            let admission = match inner.executors.service.admit().await {
                Ok(admission) => admission,
                Err(_) => return overloaded(&inner, conn, connection_id).await,
            };
            if let Err(e) = conn.await_first_byte(config.read_timeout).await {
                trace!(connection_id, cause = %e, "read aborted before first request");
                return close_connection(&inner, conn).await;
            }
            admission
        } else {
            let idle = match inner.executors.keep_alive.try_admit() {
                Ok(admission) => admission,
                Err(e) => {
                    debug!(connection_id, cause = %e, "read aborted");
                    return close_connection(&inner, conn).await;
                }
            };
            let wait = config.keep_alive.as_ref().map(|k| k.timeout()).unwrap_or(config.read_timeout);
            let waited = conn.await_first_byte(wait).await;
            drop(idle);
            if let Err(e) = waited {
                trace!(connection_id, request_count, cause = %e, "persistent connection ended");
                return close_connection(&inner, conn).await;
            }
            match inner.executors.service.admit().await {
                Ok(admission) => admission,
                Err(_) => return overloaded(&inner, conn, connection_id).await,
            }
        };

        // steps 2..8 under the service admission
        let fate = iterate(&inner, &handle, &mut conn, connection_id, request_count, peer).await;
        drop(admission);

        match fate {
            Fate::Persist => request_count += 1,
            Fate::Close => return close_connection(&inner, conn).await,
            Fate::Upgrade(handoff) => {
                match inner.executors.upgrade.try_admit() {
                    Ok(admission) => {
                        let (io, leftover) = conn.into_parts();
                        let stream: ServerStream =
                            if leftover.is_empty() { io } else { Box::new(PrefixedIo::new(leftover, io)) };
                        debug!(connection_id, "connection handed off to upgrade");
                        inner.executors.spawn(admission, handoff(stream));
                    }
                    Err(e) => {
                        error!(connection_id, cause = %e, "upgrade rejected, closing connection");
                        close_connection(&inner, conn).await;
                    }
                }
                return;
            }
        }
    }
}

/// One request/response exchange (steps 2..8 of the state machine).
async fn iterate<A>(
    inner: &Arc<ServerInner<A>>,
    handle: &ServerHandle,
    conn: &mut Connection<ServerStream>,
    connection_id: u64,
    request_count: u32,
    peer: SocketAddr,
) -> Fate
where
    A: Application + Send + Sync + 'static,
{
    let config = &inner.config;
    let correlate = Correlate::new(inner.id, connection_id, request_count);

    // step 2: parse; mapped failures answer without touching the pipeline
    let (head, payload_size) = match conn.read_head(config.read_timeout).await {
        Ok(parsed) => parsed,
        Err(e) => {
            return match e.status() {
                Some(status) => {
                    debug!(%correlate, cause = %e, %status, "request rejected during parse");
                    write_response(inner, conn, simple_response(status), &correlate).await
                }
                None => {
                    debug!(%correlate, cause = %e, "read aborted during parse");
                    Fate::Close
                }
            };
        }
    };

    let (entity, mut pump) = conn.begin_body(payload_size, config.read_timeout);
    let mut req = head.body(entity);
    req.extensions_mut().insert(handle.clone());
    req.extensions_mut().insert(PeerAddr(peer));
    req.extensions_mut().insert(RequestCount(request_count));
    req.extensions_mut().insert(correlate.clone());
    let origin = OriginRequest::snapshot(&req);

    debug!(%correlate, method = %origin.method(), target = %origin.uri(), request_count, "dispatching request");

    // steps 3/4: run the handler while streaming its body from the socket
    let outcome = run_handler(&inner.app, req, &mut pump).await;

    // the body must be fully consumed before the response goes out
    let mut force_close = false;
    if let Err(e) = pump.drain().await {
        debug!(%correlate, cause = %e, "failed draining request body");
        force_close = true;
    }

    let response = match outcome {
        Ok(flow) => {
            let mut response = match flow {
                Flow::Respond(response) => response,
                Flow::Forward(req) => {
                    drop(req);
                    simple_response(StatusCode::NOT_FOUND)
                }
            };
            manager::apply_keep_alive(config.keep_alive.as_ref(), &origin, request_count, &mut response);
            response
        }
        Err(e) if is_abort(&e) => {
            debug!(%correlate, "response aborted");
            return Fate::Close;
        }
        Err(e) => match inner.app.recover(&origin, &e) {
            Some(response) => response,
            None => {
                error!(%correlate, cause = %e, "request handler failed");
                simple_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
    };

    // attributes propagated from the originating request
    let mut response = response;
    response.extensions_mut().insert(origin);
    response.extensions_mut().insert(handle.clone());
    response.extensions_mut().insert(PeerAddr(peer));
    response.extensions_mut().insert(RequestCount(request_count));
    response.extensions_mut().insert(correlate.clone());

    // step 5: response filters
    let mut response = match inner.app.filter(response).await {
        Ok(response) => response,
        Err(e) if is_abort(&e) => {
            debug!(%correlate, "response aborted by filter");
            return Fate::Close;
        }
        Err(e) => {
            error!(%correlate, cause = %e, "response filter failed");
            let mut response = simple_response(StatusCode::INTERNAL_SERVER_ERROR);
            response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    };

    if force_close {
        response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    // steps 6..8
    write_response(inner, conn, response, &correlate).await
}

async fn run_handler<A>(
    app: &A,
    req: crate::protocol::HttpRequest,
    pump: &mut BodyPump<'_, ServerStream>,
) -> Result<Flow, crate::protocol::BoxError>
where
    A: Application + Send + Sync + 'static,
{
    let handler = app.handle(req);
    tokio::pin!(handler);

    loop {
        if pump.is_done() {
            break handler.await;
        }
        tokio::select! {
            // favour finishing the handler over pumping more body bytes
            biased;
            outcome = &mut handler => break outcome,
            _ = pump.step() => {}
        }
    }
}

/// Finalizes, frames and writes one response, then reports the connection's
/// fate. Used for pipeline responses and for direct engine responses (parse
/// failures, overload) alike.
async fn write_response<A>(
    inner: &Arc<ServerInner<A>>,
    conn: &mut Connection<ServerStream>,
    mut response: HttpResponse,
    correlate: &Correlate,
) -> Fate
where
    A: Application + Send + Sync + 'static,
{
    // step 6: Date, Connection, framing
    finalize(&mut response);
    let (payload_size, codings) = match prepare(&mut response) {
        Ok(prepared) => prepared,
        Err(e) => {
            // surfaced as response-abort: nothing is written, connection dies
            error!(%correlate, cause = %e, "cannot frame response, aborting");
            return Fate::Close;
        }
    };

    // step 8's decision is derived from the final headers, taken before the
    // response value is consumed by the write
    let decision = manager::evaluate(&response);

    let (parts, mut body) = response.into_parts();
    for coding in codings {
        body = match coding {
            ContentCoding::Deflate => compress::deflate(body),
            ContentCoding::Gzip => {
                let (wrapped, task) = compress::gzip(body);
                let admission = inner.executors.encoder.try_admit().expect("encoder pool never rejects");
                inner.executors.spawn(admission, task);
                wrapped
            }
        };
    }

    // step 7: the write; errors are logged, never answered on the same
    // connection
    match conn.write_response(ResponseHead::from(parts), payload_size, body).await {
        Ok(()) => {
            trace!(%correlate, "response written");
            match decision {
                ConnectionDecision::Close => Fate::Close,
                ConnectionDecision::Persist => Fate::Persist,
                ConnectionDecision::Upgrade(handoff) => Fate::Upgrade(handoff),
            }
        }
        Err(e) => {
            error!(%correlate, cause = %e, "failed writing response");
            Fate::Close
        }
    }
}

/// Answers `503 Service Unavailable` when the service pool rejects, then
/// closes the connection.
async fn overloaded<A>(inner: &Arc<ServerInner<A>>, mut conn: Connection<ServerStream>, connection_id: u64)
where
    A: Application + Send + Sync + 'static,
{
    warn!(server = inner.id, connection_id, "service pool rejected request");

    let mut response = simple_response(StatusCode::SERVICE_UNAVAILABLE);
    response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("300"));

    let correlate = Correlate::new(inner.id, connection_id, 0);
    let _ = write_response(inner, &mut conn, response, &correlate).await;
    close_connection(inner, conn).await;
}

/// Schedules the transport shutdown on the closer pool.
async fn close_connection<A>(inner: &Arc<ServerInner<A>>, conn: Connection<ServerStream>)
where
    A: Application + Send + Sync + 'static,
{
    let admission = inner.executors.closer.admit().await.expect("closer pool never rejects");
    inner.executors.spawn(admission, conn.shutdown());
}

fn simple_response(status: StatusCode) -> HttpResponse {
    Response::builder().status(status).body(Entity::empty()).expect("static response builds")
}

/// Sets `Date` and defaults `Connection: close` when no filter chose
/// otherwise.
fn finalize(response: &mut HttpResponse) {
    if !response.headers().contains_key(header::DATE) {
        response.headers_mut().insert(header::DATE, DateService::global().header_value());
    }
    if !response.headers().contains_key(header::CONNECTION) {
        response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
}

/// Decides the wire framing, normalizing the framing headers so that
/// exactly one of `Content-Length` or `Transfer-Encoding: chunked` reaches
/// the wire for a response with a body.
fn prepare(response: &mut HttpResponse) -> Result<(PayloadSize, Vec<ContentCoding>), SendError> {
    if response.headers().contains_key(header::TRANSFER_ENCODING) {
        let mut codings = Vec::new();
        for value in response.headers().get_all(header::TRANSFER_ENCODING) {
            let text = value.to_str().map_err(|_| SendError::unsupported_coding("non-ascii transfer coding"))?;
            for token in text.split(',') {
                if token.trim().eq_ignore_ascii_case("chunked") {
                    continue;
                }
                if let Some(coding) = ContentCoding::parse(token)? {
                    codings.push(coding);
                }
            }
        }

        // chunked must come last; anything before it is a content coding
        let chunked_last = ends_in_chunked(response.headers().get(header::TRANSFER_ENCODING));
        if !codings.is_empty() || !chunked_last {
            let mut listed: Vec<&str> = codings.iter().map(ContentCoding::name).collect();
            listed.push("chunked");
            let value = HeaderValue::try_from(listed.join(", ")).expect("coding names are ascii");
            response.headers_mut().insert(header::TRANSFER_ENCODING, value);
        }
        response.headers_mut().remove(header::CONTENT_LENGTH);
        return Ok((PayloadSize::Chunked, codings));
    }

    if excluded_from_framing(response) {
        response.headers_mut().remove(header::CONTENT_LENGTH);
        return Ok((PayloadSize::Empty, Vec::new()));
    }

    if let Some(value) = response.headers().get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| SendError::invalid_body("invalid content-length on response"))?;
        let payload_size = if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) };
        return Ok((payload_size, Vec::new()));
    }

    match response.body().size() {
        Some(0) => {
            response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            Ok((PayloadSize::Empty, Vec::new()))
        }
        Some(length) => {
            response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            Ok((PayloadSize::Length(length), Vec::new()))
        }
        None => {
            response.headers_mut().insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Ok((PayloadSize::Chunked, Vec::new()))
        }
    }
}

/// Informational, `204 No Content` and responses to CONNECT carry neither
/// `Content-Length` nor `Transfer-Encoding`.
fn excluded_from_framing(response: &HttpResponse) -> bool {
    let status = response.status();
    if status.is_informational() || status == StatusCode::NO_CONTENT {
        return true;
    }
    response
        .extensions()
        .get::<OriginRequest>()
        .is_some_and(|origin| origin.method() == http::Method::CONNECT)
}
