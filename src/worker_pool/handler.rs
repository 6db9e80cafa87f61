// ABOUTME: Per-worker message channel correlating framed requests with responses
// ABOUTME: One task per connection owns the socket halves and the pending-reply table

//! Message channel for a single worker connection.
//!
//! # Flow
//!
//! 1. Caller hands a payload to [`Handler::send_message_with_reply`]
//! 2. Handler assigns the next correlation id and stamps the [`Reply`]
//! 3. The connection task registers the completer, then queues the frame for
//!    the writer task (frames leave in send order)
//! 4. The read loop decodes response frames and finishes the matching reply
//!
//! When the connection ends for any reason every pending reply fails with
//! [`ReplyError::ConnectionLost`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info_span, trace, warn, Instrument};

use super::framing::{encode_frame, read_frame, Frame, FrameDecoder, FrameError};
use super::reply::{self, Reply, ReplyCompleter, ReplyError};

/// Why a handler's connection task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Worker closed its end of the socket
    PeerClosed,
    /// The owning `Handler` was dropped
    Dropped,
    /// Socket read or write failed
    Io(String),
    /// Worker sent bytes that cannot be framed
    MalformedFrame(String),
}

/// Request travelling from the Handler to its connection task
struct Outgoing {
    id: u64,
    payload: Vec<u8>,
    completer: ReplyCompleter,
}

/// Framed, correlated request/response channel over one worker socket.
///
/// Dropping the Handler closes the connection and fails pending replies.
pub struct Handler {
    name: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
    next_id: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Handler {
    /// Wrap an accepted worker connection.
    ///
    /// Spawns the connection task on the current tokio runtime. `on_close`
    /// runs once, after pending replies have been failed.
    pub fn spawn<F>(stream: UnixStream, name: impl Into<String>, max_frame_len: usize, on_close: F) -> Self
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let name = name.into();
        let (outbox, inbox) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let span = info_span!("handler", worker = %name);
        let task_pending = Arc::clone(&pending);
        tokio::spawn(
            async move {
                let reason = connection_loop(stream, inbox, max_frame_len, task_pending).await;
                debug!(reason = ?reason, "Worker connection closed");
                on_close(reason);
            }
            .instrument(span),
        );

        Self {
            name,
            outbox,
            next_id: AtomicU64::new(1),
            pending,
        }
    }

    /// Label used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `payload` and return a reply that finishes when the worker answers.
    ///
    /// Never blocks. If the connection is already gone the reply is finished
    /// with [`ReplyError::ConnectionLost`].
    pub fn send_message_with_reply(&self, payload: Vec<u8>) -> Reply {
        let (reply, completer) = reply::channel();
        if let Err((_, completer)) = self.dispatch(payload, completer) {
            completer.fail(ReplyError::ConnectionLost);
        }
        reply
    }

    /// Queue a request whose reply half already exists.
    ///
    /// Hands the request back when the connection task has ended so the caller
    /// can route it elsewhere.
    pub(crate) fn dispatch(
        &self,
        payload: Vec<u8>,
        completer: ReplyCompleter,
    ) -> Result<u64, (Vec<u8>, ReplyCompleter)> {
        if self.outbox.is_closed() {
            return Err((payload, completer));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        completer.set_id(id);

        match self.outbox.send(Outgoing { id, payload, completer }) {
            Ok(()) => Ok(id),
            Err(mpsc::error::SendError(outgoing)) => Err((outgoing.payload, outgoing.completer)),
        }
    }

    /// Whether the connection task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Number of requests written but not yet answered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Owns the socket: routes responses, forwards requests to the writer task,
/// and fails whatever is left when the connection ends.
async fn connection_loop(
    stream: UnixStream,
    mut inbox: mpsc::UnboundedReceiver<Outgoing>,
    max_frame_len: usize,
    pending_gauge: Arc<AtomicUsize>,
) -> CloseReason {
    let (mut reader, writer) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut writer_task = tokio::spawn(write_loop(writer, frames_rx).in_current_span());

    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut pending: HashMap<u64, ReplyCompleter> = HashMap::new();

    let reason = loop {
        tokio::select! {
            outgoing = inbox.recv() => {
                let Some(Outgoing { id, payload, completer }) = outgoing else {
                    break CloseReason::Dropped;
                };

                match encode_frame(id, &payload, max_frame_len) {
                    Ok(bytes) => {
                        pending.insert(id, completer);
                        if frames_tx.send(bytes).is_err() {
                            break CloseReason::Io("writer stopped".to_string());
                        }
                        trace!(id, bytes = payload.len(), "Request queued for write");
                    }
                    Err(e) => {
                        warn!(id, error = %e, "Dropping request that cannot be framed");
                        completer.fail(ReplyError::RequestTooLarge);
                    }
                }
            }

            frame = read_frame(&mut reader, &mut decoder) => {
                match frame {
                    Ok(Some(frame)) => route_response(&mut pending, frame),
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(FrameError::Io(e)) => break CloseReason::Io(e.to_string()),
                    Err(e) => {
                        warn!(error = %e, "Malformed frame from worker, closing connection");
                        break CloseReason::MalformedFrame(e.to_string());
                    }
                }
            }

            result = &mut writer_task => {
                let detail = match result {
                    Ok(Ok(())) => "writer finished".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                break CloseReason::Io(detail);
            }
        }

        pending_gauge.store(pending.len(), Ordering::Relaxed);
    };

    // Closing the frame channel lets the writer drain and shut the socket down
    drop(frames_tx);

    inbox.close();
    let mut lost = 0usize;
    while let Ok(Outgoing { completer, .. }) = inbox.try_recv() {
        completer.fail(ReplyError::ConnectionLost);
        lost += 1;
    }
    lost += pending.len();
    for (_, completer) in pending.drain() {
        completer.fail(ReplyError::ConnectionLost);
    }
    pending_gauge.store(0, Ordering::Relaxed);

    if lost > 0 {
        warn!(lost, reason = ?reason, "Failed pending requests on closed worker connection");
    }

    reason
}

fn route_response(pending: &mut HashMap<u64, ReplyCompleter>, frame: Frame) {
    match pending.remove(&frame.id) {
        Some(completer) => {
            trace!(id = frame.id, bytes = frame.payload.len(), "Response routed");
            completer.succeed(frame.payload);
        }
        None => {
            warn!(id = frame.id, "Response for unknown request id, discarding");
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    while let Some(bytes) = frames.recv().await {
        writer.write_all(&bytes).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::framing::{write_frame, DEFAULT_MAX_FRAME_LEN};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn spawn_handler(stream: UnixStream) -> (Handler, oneshot::Receiver<CloseReason>) {
        let (tx, rx) = oneshot::channel();
        let handler = Handler::spawn(stream, "test", DEFAULT_MAX_FRAME_LEN, move |reason| {
            let _ = tx.send(reason);
        });
        (handler, rx)
    }

    async fn next_request(worker: &mut UnixStream, decoder: &mut FrameDecoder) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), read_frame(worker, decoder))
            .await
            .expect("request in time")
            .expect("readable")
            .expect("not EOF")
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, _closed) = spawn_handler(ours);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

        let first = handler.send_message_with_reply(b"a".to_vec());
        let second = handler.send_message_with_reply(b"b".to_vec());

        assert_eq!(first.id(), Some(1));
        assert_eq!(second.id(), Some(2));
        assert_eq!(handler.name(), "test");

        // Written in send order
        assert_eq!(next_request(&mut worker, &mut decoder).await, Frame { id: 1, payload: b"a".to_vec() });
        assert_eq!(next_request(&mut worker, &mut decoder).await, Frame { id: 2, payload: b"b".to_vec() });
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_own_reply() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, _closed) = spawn_handler(ours);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

        let replies: Vec<Reply> = (0..3)
            .map(|i| handler.send_message_with_reply(format!("req-{i}").into_bytes()))
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(next_request(&mut worker, &mut decoder).await);
        }

        // Answer in reverse order, echoing the payload
        for request in requests.iter().rev() {
            write_frame(&mut worker, request.id, &request.payload, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap();
        }

        for (i, reply) in replies.iter().enumerate() {
            let outcome = tokio::time::timeout(Duration::from_secs(5), reply.wait()).await.unwrap();
            assert_eq!(outcome, Ok(format!("req-{i}").into_bytes()));
        }
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_discarded() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, _closed) = spawn_handler(ours);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

        let reply = handler.send_message_with_reply(b"ping".to_vec());
        let request = next_request(&mut worker, &mut decoder).await;

        write_frame(&mut worker, 999, b"stray", DEFAULT_MAX_FRAME_LEN).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reply.is_finished());

        write_frame(&mut worker, request.id, b"pong", DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), reply.wait()).await.unwrap();
        assert_eq!(outcome, Ok(b"pong".to_vec()));
        assert!(!handler.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_replies() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, closed) = spawn_handler(ours);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

        let replies: Vec<Reply> = (0..4).map(|_| handler.send_message_with_reply(vec![0])).collect();
        for _ in 0..4 {
            next_request(&mut worker, &mut decoder).await;
        }
        drop(worker);

        let reason = tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::PeerClosed);

        for reply in &replies {
            assert_eq!(reply.outcome(), Some(Err(ReplyError::ConnectionLost)));
        }
        assert!(handler.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_length_closes_connection() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, closed) = spawn_handler(ours);

        let reply = handler.send_message_with_reply(b"x".to_vec());
        worker.write_all(&2u32.to_be_bytes()).await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap().unwrap();
        assert!(matches!(reason, CloseReason::MalformedFrame(_)));
        assert_eq!(reply.wait().await, Err(ReplyError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_dropping_handler_fails_pending_and_closes_socket() {
        let (ours, mut worker) = UnixStream::pair().unwrap();
        let (handler, closed) = spawn_handler(ours);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);

        let reply = handler.send_message_with_reply(b"never answered".to_vec());
        next_request(&mut worker, &mut decoder).await;
        drop(handler);

        let reason = tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Dropped);
        assert_eq!(reply.wait().await, Err(ReplyError::ConnectionLost));

        // Worker sees EOF once our write half shuts down
        let eof = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut worker, &mut decoder))
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails_immediately() {
        let (ours, worker) = UnixStream::pair().unwrap();
        let (handler, closed) = spawn_handler(ours);
        drop(worker);
        let _ = tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap();

        let reply = handler.send_message_with_reply(b"late".to_vec());
        assert_eq!(reply.outcome(), Some(Err(ReplyError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_dispatch_hands_back_request_when_closed() {
        let (ours, worker) = UnixStream::pair().unwrap();
        let (handler, closed) = spawn_handler(ours);
        drop(worker);
        let _ = tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap();

        let (reply, completer) = reply::channel();
        let (payload, completer) = handler.dispatch(b"reroute me".to_vec(), completer).unwrap_err();
        assert_eq!(payload, b"reroute me");
        assert!(!reply.is_finished());
        drop(completer);
    }
}
