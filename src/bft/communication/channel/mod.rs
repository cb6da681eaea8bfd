//! Channels used to ferry `Message`s between the asynchronous tasks
//! that make up a `Node`'s transport layer and the replica's single
//! dispatcher thread.

#[cfg(feature = "channel_futures_mpsc")]
mod futures_mpsc;

#[cfg(feature = "channel_futures_mpsc")]
use self::futures_mpsc as backend;

#[cfg(feature = "channel_flume_mpmc")]
mod flume_mpmc;

#[cfg(feature = "channel_flume_mpmc")]
use self::flume_mpmc as backend;

use crate::bft::communication::message::Message;
use crate::bft::error::*;

/// The sending half of a `Message` channel.
pub struct MessageChannelTx<O> {
    inner: backend::ChannelTx<Message<O>>,
}

/// The receiving half of a `Message` channel.
pub struct MessageChannelRx<O> {
    inner: backend::ChannelRx<Message<O>>,
}

/// Creates a new, bounded `Message` channel, with capacity `bound`.
pub fn new_message_channel<O>(bound: usize) -> (MessageChannelTx<O>, MessageChannelRx<O>) {
    let (tx, rx) = backend::new_channel(bound);
    (MessageChannelTx { inner: tx }, MessageChannelRx { inner: rx })
}

impl<O> Clone for MessageChannelTx<O> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<O> MessageChannelTx<O> {
    /// Queues a message to be delivered to the dispatcher, asynchronously.
    pub async fn send(&mut self, message: Message<O>) -> Result<()> {
        self.inner.send(message).await.simple(ErrorKind::Communication)
    }
}

impl<O> MessageChannelRx<O> {
    /// Awaits for a new message to be delivered by the transport layer.
    pub async fn recv(&mut self) -> Result<Message<O>> {
        self.inner.recv().await.simple(ErrorKind::Communication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::message::Message;
    use crate::bft::communication::NodeId;
    use crate::bft::error::Error;
    use crate::bft::error::ErrorKind;

    #[test]
    fn test_channel_delivers_in_fifo_order() {
        let (mut tx, mut rx) = new_message_channel::<u32>(8);
        crate::bft::async_runtime::init(1).unwrap();
        crate::bft::async_runtime::block_on(async move {
            tx.send(Message::Error(NodeId::from(0), Error::simple(ErrorKind::Communication)))
                .await
                .unwrap();
            let msg = rx.recv().await.unwrap();
            assert!(matches!(msg, Message::Error(id, _) if id == NodeId::from(0)));
        });
    }
}
