use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::runner::Control;
use crate::task::{CompletionEvent, Outcome, TaskId};

/// Single-assignment handle to a submitted task's outcome.
///
/// Await it for the outcome, or poll with [`TaskHandle::try_outcome`]. The
/// outcome is delivered exactly once. Dropping the handle does not cancel the
/// task; call [`TaskHandle::cancel`] for that.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    job: String,
    rx: oneshot::Receiver<Outcome>,
    control: mpsc::UnboundedSender<Control>,
    taken: bool,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        job: String,
        rx: oneshot::Receiver<Outcome>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            id,
            job,
            rx,
            control,
            taken: false,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Name of the job this task runs.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Request cancellation: queued tasks are dropped before any spawn,
    /// running tasks get their worker killed. Best-effort and asynchronous;
    /// the handle resolves (as cancelled, or with the real outcome if it won
    /// the race) once the runner has acted.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel(self.id.clone()));
    }

    /// Non-blocking poll. `None` while the task is unresolved, and again
    /// after the outcome has already been taken.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        if self.taken {
            return None;
        }
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.taken = true;
                Some(outcome)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            // The resolver is never dropped unsent by a live runner; a closed
            // channel means the runner tore down, which counts as cancelled.
            Err(oneshot::error::TryRecvError::Closed) => {
                self.taken = true;
                Some(Outcome::Cancelled)
            }
        }
    }
}

impl Future for TaskHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.taken = true;
                Poll::Ready(result.unwrap_or(Outcome::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Item yielded by [`CompletionStream::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(CompletionEvent),
    /// The consumer fell behind and this many older events were discarded.
    Lagged(u64),
}

/// One subscriber's view of the completion event stream.
///
/// Each subscriber drains independently; a slow subscriber observes
/// [`StreamItem::Lagged`] instead of slowing the runner down.
#[derive(Debug)]
pub struct CompletionStream {
    rx: broadcast::Receiver<CompletionEvent>,
}

impl CompletionStream {
    pub(crate) fn new(rx: broadcast::Receiver<CompletionEvent>) -> Self {
        Self { rx }
    }

    /// Next item, or `None` once the runner has stopped and all buffered
    /// events are drained.
    pub async fn next(&mut self) -> Option<StreamItem> {
        match self.rx.recv().await {
            Ok(event) => Some(StreamItem::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "completion stream consumer lagged");
                Some(StreamItem::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`CompletionStream::next`]; `None` when no
    /// item is ready right now or the stream is closed and drained.
    pub fn try_next(&mut self) -> Option<StreamItem> {
        match self.rx.try_recv() {
            Ok(event) => Some(StreamItem::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                Some(StreamItem::Lagged(skipped))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FailureKind, OutcomeKind, TaskFailure};
    use chrono::Utc;
    use std::time::Duration;

    fn test_handle() -> (
        TaskHandle,
        oneshot::Sender<Outcome>,
        mpsc::UnboundedReceiver<Control>,
    ) {
        let (tx, rx) = oneshot::channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let handle = TaskHandle::new(TaskId::from("t-1"), "echo".to_string(), rx, ctl_tx);
        (handle, tx, ctl_rx)
    }

    #[test]
    fn try_outcome_delivers_once() {
        let (mut handle, tx, _ctl) = test_handle();
        assert_eq!(handle.try_outcome(), None);

        tx.send(Outcome::Completed(serde_json::json!(5))).unwrap();
        assert_eq!(
            handle.try_outcome(),
            Some(Outcome::Completed(serde_json::json!(5)))
        );
        assert_eq!(handle.try_outcome(), None);
    }

    #[tokio::test]
    async fn await_resolves_with_sent_outcome() {
        let (handle, tx, _ctl) = test_handle();
        tx.send(Outcome::Failed(TaskFailure::new(FailureKind::Died, "gone")))
            .unwrap();
        let outcome = handle.await;
        assert_eq!(outcome.kind(), OutcomeKind::Failed(FailureKind::Died));
    }

    #[tokio::test]
    async fn dropped_resolver_reads_as_cancelled() {
        let (handle, tx, _ctl) = test_handle();
        drop(tx);
        assert_eq!(handle.await, Outcome::Cancelled);
    }

    #[test]
    fn cancel_sends_control_message() {
        let (handle, _tx, mut ctl) = test_handle();
        handle.cancel();
        match ctl.try_recv() {
            Ok(Control::Cancel(id)) => assert_eq!(id, TaskId::from("t-1")),
            other => panic!("unexpected control message: {other:?}"),
        }
    }

    fn event(n: u64) -> CompletionEvent {
        CompletionEvent {
            id: TaskId::from(format!("t-{n}")),
            job: "echo".to_string(),
            kind: OutcomeKind::Completed,
            duration: Duration::from_millis(n),
            finished_at: Utc::now(),
            error: None,
        }
    }

    #[tokio::test]
    async fn stream_yields_events_then_closes() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = CompletionStream::new(rx);

        tx.send(event(1)).unwrap();
        tx.send(event(2)).unwrap();
        drop(tx);

        match stream.next().await {
            Some(StreamItem::Event(e)) => assert_eq!(e.id, TaskId::from("t-1")),
            other => panic!("unexpected item: {other:?}"),
        }
        match stream.next().await {
            Some(StreamItem::Event(e)) => assert_eq!(e.id, TaskId::from("t-2")),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_sees_lag_marker() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = CompletionStream::new(rx);

        for n in 0..4 {
            tx.send(event(n)).unwrap();
        }

        assert_eq!(stream.next().await, Some(StreamItem::Lagged(2)));
        match stream.next().await {
            Some(StreamItem::Event(e)) => assert_eq!(e.id, TaskId::from("t-2")),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn try_next_drains_without_blocking() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = CompletionStream::new(rx);
        assert_eq!(stream.try_next(), None);

        tx.send(event(7)).unwrap();
        match stream.try_next() {
            Some(StreamItem::Event(e)) => assert_eq!(e.id, TaskId::from("t-7")),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
