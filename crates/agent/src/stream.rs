use futures::Stream;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;
use webscout_core::{Error, Result, StreamEvent};

/// Sending half handed to a mission producer.
pub type EventSender = mpsc::Sender<Result<StreamEvent>>;

const EVENT_BUFFER: usize = 64;

/// Events of one running mission.
///
/// The stream ends after the producer finishes. An `Err` item is the
/// producer's failure and is always the last item; a producer that panics
/// ends the stream with `Error::Other`. Dropping the stream aborts the
/// producer task.
pub struct MissionStream {
    rx: mpsc::Receiver<Result<StreamEvent>>,
    task: JoinHandle<()>,
    finished: bool,
}

fn panic_detail(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

impl MissionStream {
    /// Run `producer` on its own task, streaming what it sends.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(producer(tx));
        Self {
            rx,
            task,
            finished: false,
        }
    }
}

impl Stream for MissionStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(item) = ready!(this.rx.poll_recv(cx)) {
            return Poll::Ready(Some(item));
        }

        // Channel closed: the producer returned or died.
        let joined = ready!(Pin::new(&mut this.task).poll(cx));
        this.finished = true;
        match joined {
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let detail = panic_detail(payload.as_ref());
                error!(panic = %detail, "Mission task panicked");
                Poll::Ready(Some(Err(Error::Other(format!("mission task panicked: {}", detail)))))
            }
            _ => Poll::Ready(None),
        }
    }
}

impl Drop for MissionStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
