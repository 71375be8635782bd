//! Body wrappers that keep a bounded copy of what passes through

use crate::capture::CapturedBody;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Appends up to `limit` bytes of the chunks it sees and counts all of them
#[derive(Debug)]
struct Recorder {
    kept: Vec<u8>,
    size: usize,
    limit: Option<usize>,
}

impl Recorder {
    fn new(limit: Option<usize>) -> Self {
        Self {
            kept: Vec::new(),
            size: 0,
            limit,
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.size = self.size.saturating_add(chunk.len());
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.kept.len()),
            None => chunk.len(),
        };
        self.kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Past the limit, so nothing more will be kept
    fn saturated(&self) -> bool {
        matches!(self.limit, Some(limit) if self.size > limit)
    }

    fn finish(self) -> CapturedBody {
        CapturedBody {
            kept: Bytes::from(self.kept),
            size: self.size,
        }
    }
}

/// Read a request body until it ends or passes `limit`.
///
/// Returns what was kept and a body that replays the frames already read
/// before continuing with the rest. When the body was not read to the end,
/// its size comes from `Content-Length` if that is larger.
pub async fn read_prefix(
    mut body: Body,
    limit: Option<usize>,
    headers: &HeaderMap,
) -> Result<(CapturedBody, Body), axum::Error> {
    let mut recorder = Recorder::new(limit);
    let mut frames = VecDeque::new();
    let mut finished = false;

    while !recorder.saturated() {
        match body.frame().await {
            Some(frame) => {
                let frame = frame?;
                if let Some(data) = frame.data_ref() {
                    recorder.observe(data);
                }
                frames.push_back(frame);
            }
            None => {
                finished = true;
                break;
            }
        }
    }

    let mut captured = recorder.finish();
    if !finished {
        if let Some(declared) = content_length(headers) {
            captured.size = captured.size.max(declared);
        }
    }

    let remaining = if finished { None } else { Some(body) };
    Ok((captured, Body::new(PrefixedBody { frames, remaining })))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Frames read ahead, then whatever is left of the original body
struct PrefixedBody {
    frames: VecDeque<Frame<Bytes>>,
    remaining: Option<Body>,
}

impl HttpBody for PrefixedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(frame) = this.frames.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        match this.remaining.as_mut() {
            Some(body) => Pin::new(body).poll_frame(cx),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.frames.is_empty()
            && self
                .remaining
                .as_ref()
                .map_or(true, HttpBody::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        let buffered: u64 = self
            .frames
            .iter()
            .filter_map(Frame::data_ref)
            .map(|data| data.len() as u64)
            .sum();
        match &self.remaining {
            None => SizeHint::with_exact(buffered),
            Some(body) => {
                let rest = body.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(rest.lower().saturating_add(buffered));
                if let Some(upper) = rest.upper() {
                    hint.set_upper(upper.saturating_add(buffered));
                }
                hint
            }
        }
    }
}

/// Passes every frame through untouched and reports the kept copy once the
/// body is finished or dropped
pub struct TeeBody {
    inner: Body,
    recorder: Option<Recorder>,
    done: Option<oneshot::Sender<CapturedBody>>,
}

impl TeeBody {
    pub fn new(inner: Body, limit: Option<usize>) -> (Self, oneshot::Receiver<CapturedBody>) {
        let (done, receiver) = oneshot::channel();
        (
            Self {
                inner,
                recorder: Some(Recorder::new(limit)),
                done: Some(done),
            },
            receiver,
        )
    }

    fn complete(&mut self) {
        if let (Some(recorder), Some(done)) = (self.recorder.take(), self.done.take()) {
            // Receiver gone means nobody wants the capture any more
            let _ = done.send(recorder.finish());
        }
    }
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(recorder)) = (frame.data_ref(), this.recorder.as_mut()) {
                    recorder.observe(data);
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        self.complete();
    }
}
