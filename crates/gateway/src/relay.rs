//! Mission events to caller-visible frames under an overall deadline.

use futures::{stream, Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use webscout_core::{Error, Result, StreamEvent};

pub const STEP_BUDGET_MESSAGE: &str = "Agent exceeded maximum reasoning steps. Try a simpler prompt.";
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred.";

fn failure_event(err: Error) -> StreamEvent {
    match err {
        Error::StepBudgetExceeded(steps) => {
            warn!(max_steps = steps, "Mission hit the step budget");
            StreamEvent::Error(STEP_BUDGET_MESSAGE.to_string())
        }
        other => {
            error!(error = %other, "Mission failed");
            StreamEvent::Error(INTERNAL_ERROR_MESSAGE.to_string())
        }
    }
}

/// Forward `events` until they end (then `Done`), fail, or `timeout` passes.
///
/// Exactly one terminal event is produced and nothing follows it. The source
/// is dropped as soon as the terminal event is decided, which aborts any
/// remaining mission work.
pub fn relay<S>(events: S, timeout: Duration) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<StreamEvent>> + Send + Unpin + 'static,
{
    let deadline = Instant::now() + timeout;
    stream::unfold(Some(events), move |source| async move {
        let mut events = source?;
        match tokio::time::timeout_at(deadline, events.next()).await {
            Ok(Some(Ok(event))) if event.is_terminal() => Some((event, None)),
            Ok(Some(Ok(event))) => Some((event, Some(events))),
            Ok(Some(Err(e))) => Some((failure_event(e), None)),
            Ok(None) => {
                info!("Mission completed");
                Some((StreamEvent::Done, None))
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Mission timed out");
                let message = format!("Request timed out after {} seconds.", timeout.as_secs());
                Some((StreamEvent::Error(message), None))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use webscout_agent::MissionStream;

    async fn run(stream: MissionStream, timeout: Duration) -> Vec<StreamEvent> {
        relay(stream, timeout).collect().await
    }

    #[tokio::test]
    async fn test_forwards_in_order_then_done() {
        let source = MissionStream::spawn(|tx| async move {
            let _ = tx.send(Ok(StreamEvent::ToolStart("crawl".into()))).await;
            let _ = tx.send(Ok(StreamEvent::ToolEnd("crawl".into()))).await;
            let _ = tx.send(Ok(StreamEvent::Token("Found it".into()))).await;
        });
        assert_eq!(
            run(source, Duration::from_secs(5)).await,
            vec![
                StreamEvent::ToolStart("crawl".into()),
                StreamEvent::ToolEnd("crawl".into()),
                StreamEvent::Token("Found it".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_deadline_emits_one_error_and_aborts_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let source = MissionStream::spawn(|tx| async move {
            let _ = tx.send(Ok(StreamEvent::Token("partial".into()))).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tx.send(Ok(StreamEvent::Token("late".into()))).await;
            flag.store(true, Ordering::SeqCst);
        });

        let events = run(source, Duration::from_secs(1)).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("partial".into()),
                StreamEvent::Error("Request timed out after 1 seconds.".into()),
            ]
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_step_budget_maps_to_advice() {
        let source = MissionStream::spawn(|tx| async move {
            let _ = tx.send(Ok(StreamEvent::ToolStart("fetch".into()))).await;
            let _ = tx.send(Err(Error::StepBudgetExceeded(15))).await;
        });
        let events = run(source, Duration::from_secs(5)).await;
        assert_eq!(events.last(), Some(&StreamEvent::Error(STEP_BUDGET_MESSAGE.into())));
        assert_eq!(events.len(), 2);
    }

    fn tool_panics() {
        panic!("tool blew up");
    }

    #[tokio::test]
    async fn test_panicking_mission_ends_with_generic_error() {
        let source = MissionStream::spawn(|tx| async move {
            let _ = tx.send(Ok(StreamEvent::ToolStart("fetch".into()))).await;
            tool_panics();
        });
        assert_eq!(
            run(source, Duration::from_secs(5)).await,
            vec![
                StreamEvent::ToolStart("fetch".into()),
                StreamEvent::Error(INTERNAL_ERROR_MESSAGE.into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_failures_are_generic() {
        let source = MissionStream::spawn(|tx| async move {
            let _ = tx
                .send(Err(Error::Provider("API error 401: secret details".into())))
                .await;
        });
        assert_eq!(
            run(source, Duration::from_secs(5)).await,
            vec![StreamEvent::Error(INTERNAL_ERROR_MESSAGE.into())]
        );
    }
}
