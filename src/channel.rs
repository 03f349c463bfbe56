use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use enclose::enc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ChannelConfig,
    error::{ChannelErrorKind, Error},
    message::SignalingMessage,
};

/// One unit of the persistent connection as seen by the channel. Servers adapt
/// their websocket message type into this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    fn data_len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close => 0,
        }
    }
}

/// Receives everything a [`SignalingChannel`] reports. Both callbacks are required when the channel is created.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Called from the read task for every decoded message, one at a time and in arrival order.
    async fn on_message(&self, id: &str, message: SignalingMessage);
    /// Called at most once, when the connection was lost rather than closed by [`SignalingChannel::close`].
    async fn on_disconnect(&self, id: &str);
}

/// Handle of one client's persistent signaling connection. Cloning the handle does not clone the connection.
#[derive(Debug, Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
    sender: mpsc::Sender<String>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct ChannelInner {
    id: String,
    closed: AtomicBool,
    close_token: CancellationToken,
    #[derivative(Debug = "ignore")]
    handler: Arc<dyn ChannelHandler>,
}

impl SignalingChannel {
    /// Takes ownership of both halves of an established connection and starts its read and write tasks.
    pub fn new<R, W>(
        id: String,
        reader: R,
        writer: W,
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self
    where
        R: Stream<Item = Result<Frame, Error>> + Send + 'static,
        W: Sink<Frame, Error = Error> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.send_queue_capacity.max(1));
        let inner = Arc::new(ChannelInner {
            id: id.clone(),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            handler,
        });

        tokio::spawn(enc!((inner, config) async move {
            Self::read_loop(inner, reader, config).await;
        }));
        tokio::spawn(enc!((inner) async move {
            Self::write_loop(inner, writer, receiver, config).await;
        }));

        tracing::debug!("SignalingChannel id={} is created", id);

        Self { inner, sender }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the channel has been closed for any reason.
    pub async fn closed(&self) {
        self.inner.close_token.cancelled().await
    }

    /// Queues `message` for the write task. Messages sent after close, or that fail to encode, are dropped.
    pub async fn send(&self, message: &SignalingMessage) {
        if self.is_closed() {
            tracing::debug!(
                "SignalingChannel id={} is closed, dropping {} message",
                self.inner.id,
                message.kind
            );
            return;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(
                    "SignalingChannel id={} failed to encode {} message: {}",
                    self.inner.id,
                    message.kind,
                    err
                );
                return;
            }
        };
        tokio::select! {
            _ = self.inner.close_token.cancelled() => {
                tracing::debug!(
                    "SignalingChannel id={} closed while queueing, dropping {} message",
                    self.inner.id,
                    message.kind
                );
            }
            result = self.sender.send(text) => {
                if result.is_err() {
                    tracing::debug!(
                        "SignalingChannel id={} write loop is gone, dropping {} message",
                        self.inner.id,
                        message.kind
                    );
                }
            }
        }
    }

    /// Closes the connection without reporting a disconnect. Calling it again does nothing.
    pub fn close(&self) {
        self.inner.close_silently();
    }

    async fn read_loop<R>(inner: Arc<ChannelInner>, reader: R, config: ChannelConfig)
    where
        R: Stream<Item = Result<Frame, Error>> + Send + 'static,
    {
        let mut reader = Box::pin(reader);
        let mut deadline = Instant::now() + config.read_timeout;

        let result = loop {
            let next = tokio::select! {
                _ = inner.close_token.cancelled() => break Ok(()),
                next = time::timeout_at(deadline, reader.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    break Err(Error::new_channel(
                        format!("nothing received for {:?}", config.read_timeout),
                        ChannelErrorKind::ReadTimeoutError,
                    ))
                }
                Ok(None) => {
                    break Err(Error::new_channel(
                        "connection closed by peer".to_string(),
                        ChannelErrorKind::ClosedError,
                    ))
                }
                Ok(Some(Err(err))) => break Err(err),
                Ok(Some(Ok(frame))) => frame,
            };

            if frame.data_len() > config.max_message_size {
                break Err(Error::new_channel(
                    format!(
                        "frame of {} bytes exceeds {} bytes",
                        frame.data_len(),
                        config.max_message_size
                    ),
                    ChannelErrorKind::MessageTooLargeError,
                ));
            }
            deadline = Instant::now() + config.read_timeout;

            let dispatched = match frame {
                Frame::Text(text) => inner.dispatch(text.as_bytes()).await,
                Frame::Binary(data) => inner.dispatch(&data).await,
                Frame::Ping(_) | Frame::Pong(_) => {
                    tracing::trace!("SignalingChannel id={} keepalive received", inner.id);
                    Ok(())
                }
                Frame::Close => {
                    break Err(Error::new_channel(
                        "close frame received".to_string(),
                        ChannelErrorKind::ClosedError,
                    ))
                }
            };
            if let Err(err) = dispatched {
                break Err(err);
            }
        };

        match result {
            Ok(()) => {}
            Err(err) => {
                match err.channel_kind() {
                    Some(ChannelErrorKind::ClosedError) => {
                        tracing::info!("SignalingChannel id={} read: {}", inner.id, err);
                    }
                    Some(ChannelErrorKind::DecodeError) => {
                        tracing::error!("SignalingChannel id={} read: {}", inner.id, err);
                    }
                    _ => {
                        tracing::warn!("SignalingChannel id={} read: {}", inner.id, err);
                    }
                }
                inner.shutdown().await;
            }
        }
        tracing::debug!("SignalingChannel id={} read loop finished", inner.id);
    }

    async fn write_loop<W>(
        inner: Arc<ChannelInner>,
        writer: W,
        mut receiver: mpsc::Receiver<String>,
        config: ChannelConfig,
    ) where
        W: Sink<Frame, Error = Error> + Send + 'static,
    {
        let mut writer = Box::pin(writer);
        let mut ping = time::interval_at(
            Instant::now() + config.ping_interval,
            config.ping_interval,
        );
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = inner.close_token.cancelled() => break Ok(()),
                _ = ping.tick() => {
                    tracing::trace!("SignalingChannel id={} ping", inner.id);
                    if let Err(err) =
                        Self::write_frame(&mut writer, Frame::Ping(Bytes::new()), config.write_timeout).await
                    {
                        break Err(err);
                    }
                }
                text = receiver.recv() => match text {
                    Some(text) => {
                        if let Err(err) =
                            Self::write_frame(&mut writer, Frame::Text(text), config.write_timeout).await
                        {
                            break Err(err);
                        }
                    }
                    // Every handle is gone, nobody can send anymore.
                    None => break Ok(()),
                },
            }
        };

        match time::timeout(config.write_timeout, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!("SignalingChannel id={} close: {}", inner.id, err);
            }
            Err(_) => {
                tracing::debug!("SignalingChannel id={} close timed out", inner.id);
            }
        }

        match result {
            Ok(()) => inner.close_silently(),
            Err(err) => {
                tracing::warn!("SignalingChannel id={} write: {}", inner.id, err);
                inner.shutdown().await;
            }
        }
        tracing::debug!("SignalingChannel id={} write loop finished", inner.id);
    }

    async fn write_frame<W>(
        writer: &mut Pin<Box<W>>,
        frame: Frame,
        write_timeout: Duration,
    ) -> Result<(), Error>
    where
        W: Sink<Frame, Error = Error>,
    {
        match time::timeout(write_timeout, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_channel(
                format!("write did not complete within {:?}", write_timeout),
                ChannelErrorKind::WriteTimeoutError,
            )),
        }
    }
}

impl ChannelInner {
    /// Decodes one frame and hands it to the handler. A frame that is not an envelope is an error.
    async fn dispatch(&self, data: &[u8]) -> Result<(), Error> {
        let message = SignalingMessage::parse(data)?;
        self.handler.on_message(&self.id, message).await;
        Ok(())
    }

    /// Marks the channel closed. Returns false when it already was.
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_token.cancel();
        true
    }

    fn close_silently(&self) {
        if self.mark_closed() {
            tracing::debug!("SignalingChannel id={} is closed", self.id);
        }
    }

    /// Closes the channel and reports the disconnect, unless it was already closed.
    async fn shutdown(&self) {
        if self.mark_closed() {
            tracing::info!("SignalingChannel id={} disconnected", self.id);
            self.handler.on_disconnect(&self.id).await;
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        tracing::debug!("SignalingChannel id={} is dropped", self.id);
    }
}
