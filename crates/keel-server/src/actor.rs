use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use log::error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 8;

/// A single-threaded actor with a mailbox.
///
/// The actor processes one message at a time to completion. Message handlers
/// suspend only at explicit awaits (disk writes, peer round trips, timers);
/// between suspension points the actor state is exclusively owned and needs
/// no lock. Handlers must not invoke blocking functions, otherwise the actor
/// event loop would stall since all messages are processed sequentially.
/// Long-running work should be spawned via [ActorContext::spawn] and report
/// back by sending the actor a message.
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    async fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message)
        -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Messages the actor sends to itself while processing a message.
    /// They are processed before anything else in the mailbox.
    queue: VecDeque<T::Message>,
    /// Tasks spawned by the actor when processing messages.
    /// All these tasks are aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            queue: VecDeque::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Enqueue a message to this actor. The message is processed before
    /// messages from other senders, and sending never blocks, so this is
    /// safe to call from within a handler.
    pub fn send(&mut self, message: T::Message) {
        self.queue.push_back(message);
    }

    /// Deliver a message to this actor after a delay.
    /// The message is silently dropped if the actor stops before the delay
    /// elapses.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message).await;
        });
    }

    /// Spawn a task and save the handle in the context.
    pub fn spawn(
        &mut self,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log panics.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("task spawned by {} panicked: {e}", T::name());
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The handle to the actor event loop task is not saved.
        // The actor runs detached and the event loop task stops by itself
        // when the stop action is taken or all handles are dropped.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(&self, message: T::Message) -> Result<(), ActorStopped> {
        self.sender.send(message).await.map_err(|_| ActorStopped)
    }

    pub async fn wait_for_stop(mut self) {
        // The receiver error is ignored since the sender must have been
        // dropped in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

/// The error returned when sending to an actor that has stopped.
#[derive(Debug, PartialEq, Eq)]
pub struct ActorStopped;

impl std::fmt::Display for ActorStopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "the actor has stopped")
    }
}

impl std::error::Error for ActorStopped {}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        self.actor.start(&mut self.ctx).await;
        loop {
            let message = if let Some(message) = self.ctx.queue.pop_front() {
                message
            } else {
                match self.receiver.recv().await {
                    Some(message) => message,
                    None => break,
                }
            };
            match self.actor.receive(&mut self.ctx, message).await {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            self.ctx.reap();
        }
        self.receiver.close();
        self.actor.stop(&mut self.ctx).await;
        let _ = self.stopped.send(true);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    struct TestActor {
        echoes: usize,
    }

    enum TestMessage {
        Echo {
            value: String,
            reply: oneshot::Sender<String>,
        },
        Count {
            reply: oneshot::Sender<usize>,
        },
        Stop,
    }

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = ();

        fn name() -> &'static str {
            "TestActor"
        }

        fn new(_options: Self::Options) -> Self {
            Self { echoes: 0 }
        }

        async fn start(&mut self, _ctx: &mut ActorContext<Self>) {}

        async fn receive(
            &mut self,
            _ctx: &mut ActorContext<Self>,
            message: TestMessage,
        ) -> ActorAction {
            match message {
                TestMessage::Echo { value, reply } => {
                    self.echoes += 1;
                    let _ = reply.send(value.to_uppercase());
                    ActorAction::Continue
                }
                TestMessage::Count { reply } => {
                    let _ = reply.send(self.echoes);
                    ActorAction::Continue
                }
                TestMessage::Stop => ActorAction::Stop,
            }
        }

        async fn stop(self, _ctx: &mut ActorContext<Self>) {}
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let handle = ActorHandle::<TestActor>::new(());
        let (tx, rx) = oneshot::channel();
        let result = handle
            .send(TestMessage::Echo {
                value: "hello".to_string(),
                reply: tx,
            })
            .await;
        assert!(matches!(result, Ok(())));
        assert_eq!(rx.await, Ok("HELLO".to_string()));

        let (tx, rx) = oneshot::channel();
        let _ = handle.send(TestMessage::Count { reply: tx }).await;
        assert_eq!(rx.await, Ok(1));
    }

    #[tokio::test]
    async fn test_actor_handle_wait_for_stop() {
        let handle = ActorHandle::<TestActor>::new(());
        let result = handle.send(TestMessage::Stop).await;
        assert!(matches!(result, Ok(())));

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.wait_for_stop().await;
    }
}
