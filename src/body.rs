// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! HTTP response bodies: complete buffers for the API endpoints, channels
//! for the MJPEG and SSE streams.

use bytes::Bytes;
use http_body::Frame;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Body of every response the server produces.
pub enum Body {
    Full(Option<Bytes>),
    /// Streaming: bytes arrive from the generator task through a bounded
    /// channel; the body ends when the sender is dropped.
    Channel(mpsc::Receiver<Bytes>),
}

impl Body {
    /// A streaming body and the sender feeding it. The buffer is small;
    /// the stream is latency-first and senders never queue much.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(4);
        (BodySender(tx), Body::Channel(rx))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Full(Some(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Full(Some(Bytes::from(s)))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Some(Bytes::from_static(s.as_bytes())))
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Body::Full(data) => Poll::Ready(data.take().map(|b| Ok(Frame::data(b)))),
            Body::Channel(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(b)) => Poll::Ready(Some(Ok(Frame::data(b)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Feeds a [`Body::Channel`]. Send fails once the client is gone.
#[derive(Clone)]
pub struct BodySender(mpsc::Sender<Bytes>);

impl BodySender {
    /// Sends one chunk; `Err` means the client disconnected.
    pub async fn send(&self, chunk: Bytes) -> Result<(), base::Error> {
        self.0
            .send(chunk)
            .await
            .map_err(|_| base::err!(ClientDisconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt as _;

    #[tokio::test]
    async fn full_body_yields_once() {
        let body = Body::from("hello");
        let collected = body.collect().await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn channel_body_streams_until_sender_drops() {
        let (tx, body) = Body::channel();
        let feeder = tokio::spawn(async move {
            tx.send(Bytes::from_static(b"a")).await.unwrap();
            tx.send(Bytes::from_static(b"b")).await.unwrap();
        });
        let collected = body.collect().await.unwrap();
        feeder.await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"ab"));
    }

    #[tokio::test]
    async fn send_fails_after_receiver_drop() {
        let (tx, body) = Body::channel();
        drop(body);
        let err = tx.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::ClientDisconnected);
    }
}
