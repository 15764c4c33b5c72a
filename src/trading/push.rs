//! Cancellable push-channel subscription with reconnect backoff.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::PushChannel;

use super::config::ReconnectPolicy;

/// Lifecycle and payload events delivered to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Connected,
    Message(String),
    Error(String),
    Disconnected,
}

/// Keeps a push channel connected until stopped.
pub struct PushSubscription {
    channel: Arc<dyn PushChannel>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

impl PushSubscription {
    /// `shutdown` stops the subscription; a child token of the caller's works well.
    pub fn new(channel: Arc<dyn PushChannel>, policy: ReconnectPolicy, shutdown: CancellationToken) -> Self {
        Self {
            channel,
            policy,
            shutdown,
        }
    }

    /// Spawn the connect/read/reconnect loop.
    pub fn start<F>(&self, on_event: F) -> JoinHandle<()>
    where
        F: Fn(PushEvent) + Send + Sync + 'static,
    {
        let channel = self.channel.clone();
        let policy = self.policy.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(run(channel, policy, shutdown, on_event))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn run<F>(channel: Arc<dyn PushChannel>, policy: ReconnectPolicy, shutdown: CancellationToken, on_event: F)
where
    F: Fn(PushEvent) + Send + Sync + 'static,
{
    let mut backoff = policy.backoff();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = channel.connect() => result,
        };

        match connected {
            Ok(mut stream) => {
                backoff.reset();
                info!("Push channel connected");
                on_event(PushEvent::Connected);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            on_event(PushEvent::Disconnected);
                            info!("Push subscription stopped");
                            return;
                        }
                        next = stream.next() => match next {
                            Some(Ok(message)) => on_event(PushEvent::Message(message)),
                            Some(Err(e)) => {
                                warn!(error = %format!("{:#}", e), "Push channel read failed");
                                on_event(PushEvent::Error(format!("{:#}", e)));
                                break;
                            }
                            None => {
                                debug!("Push channel closed by peer");
                                break;
                            }
                        },
                    }
                }

                on_event(PushEvent::Disconnected);
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Push channel connect failed");
                on_event(PushEvent::Error(format!("{:#}", e)));
            }
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(Duration::from_millis(policy.max_delay_ms));
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting push channel");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Push subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::api::PushStream;

    /// Fails the first connect, then serves two messages per connection.
    struct FlakyChannel {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PushChannel for FlakyChannel {
        async fn connect(&self) -> Result<PushStream> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("connection refused");
            }
            let messages = vec![Ok("a".to_string()), Ok("b".to_string())];
            Ok(futures::stream::iter(messages).boxed())
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_failure_and_close() {
        let channel = Arc::new(FlakyChannel {
            attempts: AtomicUsize::new(0),
        });
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = PushSubscription::new(channel.clone(), fast_policy(), CancellationToken::new());

        let sink = events.clone();
        let handle = subscription.start(move |event| sink.lock().push(event));

        tokio::time::sleep(Duration::from_millis(150)).await;
        subscription.stop();
        handle.await.unwrap();

        let events = events.lock();
        assert_eq!(
            events[..6],
            [
                PushEvent::Error("connection refused".to_string()),
                PushEvent::Connected,
                PushEvent::Message("a".to_string()),
                PushEvent::Message("b".to_string()),
                PushEvent::Disconnected,
                PushEvent::Connected,
            ]
        );
        assert!(channel.attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stop_before_connect() {
        let channel = Arc::new(FlakyChannel {
            attempts: AtomicUsize::new(1),
        });
        let token = CancellationToken::new();
        token.cancel();

        let subscription = PushSubscription::new(channel.clone(), fast_policy(), token);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        subscription.start(move |event| sink.lock().push(event)).await.unwrap();

        assert!(events.lock().is_empty());
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 1);
    }

    /// Serves an endless stream of messages.
    struct ChattyChannel;

    #[async_trait]
    impl PushChannel for ChattyChannel {
        async fn connect(&self) -> Result<PushStream> {
            Ok(futures::stream::repeat_with(|| Ok("tick".to_string())).boxed())
        }
    }

    #[tokio::test]
    async fn test_stop_while_streaming_ends_with_disconnect() {
        let token = CancellationToken::new();
        let subscription = PushSubscription::new(Arc::new(ChattyChannel), fast_policy(), token.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let stopper = token.clone();
        let handle = subscription.start(move |event| {
            if matches!(event, PushEvent::Message(_)) {
                stopper.cancel();
            }
            sink.lock().push(event);
        });
        handle.await.unwrap();

        // a cancelled token wins over a ready message
        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                PushEvent::Connected,
                PushEvent::Message("tick".to_string()),
                PushEvent::Disconnected,
            ]
        );
    }
}
