//! Channel-Fed Request Body
//!
//! The upload side of a PUT to a storage node. The data plane holds the
//! sender and pushes client chunks as they arrive; hyper polls the receiver
//! as the wire drains, so backpressure reaches all the way back to the
//! client socket. Nothing is buffered beyond the channel's small depth.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Channel depth. One frame in flight per node keeps the fan-out paced by
/// the slowest backend without stalling the others between chunks.
const CHANNEL_DEPTH: usize = 2;

/// Create a connected (sender, body) pair
pub fn channel(content_length: Option<u64>) -> (BodySender, ChannelBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        BodySender { tx },
        ChannelBody {
            rx,
            remaining: content_length,
        },
    )
}

/// Producer half
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    /// Push one chunk. Fails when the connection consuming the body has
    /// gone away.
    pub async fn send(&self, chunk: Bytes) -> Result<(), ChannelClosed> {
        self.tx.send(chunk).await.map_err(|_| ChannelClosed)
    }

    /// True once the consuming connection is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The consuming connection has dropped the body
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelClosed;

/// Consumer half, handed to hyper as the request body
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
    remaining: Option<u64>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(chunk.len() as u64);
                }
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(remaining) => SizeHint::with_exact(remaining),
            None => SizeHint::default(),
        }
    }
}
