//! One request/response exchange on its own HTTP/2 stream
//!
//! Each accepted request runs in a small task so the worker's event loop
//! never waits on a single stream. The task reports back through the
//! worker's event channel; aborting it drops the stream handles, which
//! resets the stream.

use crate::error::PushError;
use crate::request::{RequestId, Response};
use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// What exchange tasks tell the worker
#[derive(Debug)]
pub(crate) enum Event {
    /// The request head went out on this stream
    Opened { id: RequestId, stream_id: u32 },

    /// The exchange ended, successfully or not
    Finished {
        id: RequestId,
        result: Result<Response, h2::Error>,
    },
}

pub(crate) fn spawn(
    id: RequestId,
    send_request: SendRequest<Bytes>,
    head: http::Request<()>,
    body: Bytes,
    events: mpsc::UnboundedSender<Event>,
) -> AbortHandle {
    tokio::spawn(async move {
        let result = exchange(id, send_request, head, body, &events).await;
        let _ = events.send(Event::Finished { id, result });
    })
    .abort_handle()
}

async fn exchange(
    id: RequestId,
    send_request: SendRequest<Bytes>,
    head: http::Request<()>,
    body: Bytes,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<Response, h2::Error> {
    let mut send_request = send_request.ready().await?;

    let end_of_stream = body.is_empty();
    let (response, mut stream) = send_request.send_request(head, end_of_stream)?;
    let _ = events.send(Event::Opened {
        id,
        stream_id: response.stream_id().as_u32(),
    });

    if !end_of_stream {
        stream.send_data(body, true)?;
    }

    let (parts, mut recv) = response.await?.into_parts();
    let mut buf = BytesMut::new();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk?;
        let _ = recv.flow_control().release_capacity(chunk.len());
        buf.extend_from_slice(&chunk);
    }

    Ok(Response::from_parts(&parts, buf.freeze()))
}

/// Map a stream error to the caller's error, and whether the whole
/// connection is gone
pub(crate) fn classify(err: &h2::Error) -> (PushError, bool) {
    if err.is_io() || err.is_go_away() {
        return (PushError::ConnectionLost, true);
    }
    if let Some(reason) = err.reason() {
        if err.is_reset() {
            return (PushError::StreamReset(reason.to_string()), false);
        }
    }
    (PushError::Transport(err.to_string()), false)
}
