//! Ordered inbox for messages arriving on the signaling channel
//!
//! Decouples arrival time from consumption time. A delivery is handed to the
//! oldest pending receiver if there is one, otherwise it is queued for the
//! next receiver. The two queues are never non-empty at the same time, which
//! the [`Backlog`] enum makes structural rather than a runtime check.
//!
//! An error condition is also latched as a fault, so code that is not
//! waiting on a message can still notice the channel broke via
//! [`Mailbox::failed`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::trace;

use steeplechase_common::{Error, Message, Result};

/// A message, or an error condition raised by the channel feeding the mailbox
type Delivery = Result<Message>;

enum Backlog {
    Empty,
    /// Deliveries nobody has asked for yet (never empty)
    Messages(VecDeque<Delivery>),
    /// Receivers waiting for a delivery (never empty)
    Waiters(VecDeque<oneshot::Sender<Delivery>>),
}

/// FIFO mailbox shared by the signaling pump and the running test
pub struct Mailbox {
    backlog: Mutex<Backlog>,
    /// Description of the first error condition delivered
    fault: watch::Sender<Option<String>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            backlog: Mutex::new(Backlog::Empty),
            fault: watch::channel(None).0,
        }
    }

    /// Hand `msg` to the oldest waiting receiver, or queue it
    pub fn deliver(&self, msg: Message) {
        trace!(action = %msg.action, "mailbox deliver");
        self.push(Ok(msg));
    }

    /// Queue an error condition; the receiver that gets it fails with `err`
    pub fn deliver_error(&self, err: Error) {
        trace!(error = %err, "mailbox deliver error");
        let description = err.to_string();
        self.push(Err(err));
        self.fault.send_if_modified(|fault| match fault {
            Some(_) => false,
            None => {
                *fault = Some(description);
                true
            }
        });
    }

    /// Resolves once an error condition has been delivered, now or earlier.
    ///
    /// Queued messages are left in place. If the error itself is still
    /// queued it is taken out and returned; if a receiver already got it,
    /// a [`Error::ChannelClosed`] carrying its description is returned.
    pub async fn failed(&self) -> Error {
        let mut faults = self.fault.subscribe();
        let description = match faults.wait_for(Option::is_some).await {
            Ok(fault) => fault.clone().unwrap_or_default(),
            Err(_) => "mailbox dropped".to_string(),
        };
        self.take_queued_error()
            .unwrap_or(Error::ChannelClosed(description))
    }

    fn take_queued_error(&self) -> Option<Error> {
        let mut backlog = self.backlog.lock();
        let Backlog::Messages(queue) = &mut *backlog else {
            return None;
        };
        let at = queue.iter().position(|delivery| delivery.is_err())?;
        let taken = queue.remove(at);
        if queue.is_empty() {
            *backlog = Backlog::Empty;
        }
        taken.and_then(|delivery| delivery.err())
    }

    fn push(&self, mut delivery: Delivery) {
        let mut backlog = self.backlog.lock();
        *backlog = match mem::replace(&mut *backlog, Backlog::Empty) {
            Backlog::Empty => Backlog::Messages(VecDeque::from([delivery])),
            Backlog::Messages(mut queue) => {
                queue.push_back(delivery);
                Backlog::Messages(queue)
            }
            Backlog::Waiters(mut waiters) => loop {
                match waiters.pop_front() {
                    Some(waiter) => match waiter.send(delivery) {
                        Ok(()) if waiters.is_empty() => break Backlog::Empty,
                        Ok(()) => break Backlog::Waiters(waiters),
                        // The receive future was dropped; try the next one.
                        Err(returned) => delivery = returned,
                    },
                    None => break Backlog::Messages(VecDeque::from([delivery])),
                }
            },
        };
    }

    /// Take the next delivery.
    ///
    /// The position in line is claimed when this is called, not when the
    /// returned future is first polled, so concurrent receivers are served in
    /// call order.
    pub fn receive(&self) -> Receive {
        let mut backlog = self.backlog.lock();
        let (next, ready) = match mem::replace(&mut *backlog, Backlog::Empty) {
            Backlog::Messages(mut queue) => match queue.pop_front() {
                Some(delivery) if queue.is_empty() => (Backlog::Empty, Some(delivery)),
                Some(delivery) => (Backlog::Messages(queue), Some(delivery)),
                None => (Backlog::Empty, None),
            },
            other => (other, None),
        };
        *backlog = next;

        if let Some(delivery) = ready {
            return Receive::Ready(Some(delivery));
        }

        let (tx, rx) = oneshot::channel();
        *backlog = match mem::replace(&mut *backlog, Backlog::Empty) {
            Backlog::Waiters(mut waiters) => {
                waiters.push_back(tx);
                Backlog::Waiters(waiters)
            }
            _ => Backlog::Waiters(VecDeque::from([tx])),
        };
        Receive::Waiting(rx)
    }

    /// Number of deliveries queued for future receivers
    pub fn queued_messages(&self) -> usize {
        match &*self.backlog.lock() {
            Backlog::Messages(queue) => queue.len(),
            _ => 0,
        }
    }

    /// Number of receivers still waiting for a delivery
    pub fn waiting_receivers(&self) -> usize {
        match &*self.backlog.lock() {
            Backlog::Waiters(waiters) => waiters.iter().filter(|w| !w.is_closed()).count(),
            _ => 0,
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Mailbox::receive`]
pub enum Receive {
    Ready(Option<Delivery>),
    Waiting(oneshot::Receiver<Delivery>),
}

impl Future for Receive {
    type Output = Result<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Receive::Ready(slot) => Poll::Ready(
                slot.take()
                    .unwrap_or_else(|| Err(Error::ChannelClosed("receive polled twice".into()))),
            ),
            Receive::Waiting(rx) => Pin::new(rx).poll(cx).map(|result| {
                result.unwrap_or_else(|_| Err(Error::ChannelClosed("mailbox dropped".into())))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use proptest::prelude::*;

    fn msg(n: usize) -> Message {
        Message::new("n").with_field("n", n)
    }

    fn number(m: &Message) -> usize {
        m.fields["n"].as_u64().unwrap() as usize
    }

    #[tokio::test]
    async fn test_queued_messages_come_out_in_arrival_order() {
        let mailbox = Mailbox::new();
        for i in 0..3 {
            mailbox.deliver(msg(i));
        }
        assert_eq!(mailbox.queued_messages(), 3);

        for i in 0..3 {
            assert_eq!(number(&mailbox.receive().await.unwrap()), i);
        }
        assert_eq!(mailbox.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_receive_before_deliver_gets_first_message() {
        let mailbox = Mailbox::new();
        let first = mailbox.receive();
        assert_eq!(mailbox.waiting_receivers(), 1);

        mailbox.deliver(msg(10));
        mailbox.deliver(msg(11));

        assert_eq!(number(&first.await.unwrap()), 10);
        assert_eq!(number(&mailbox.receive().await.unwrap()), 11);
        assert_eq!(mailbox.waiting_receivers(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_receivers_served_in_call_order() {
        let mailbox = Mailbox::new();
        let a = mailbox.receive();
        let b = mailbox.receive();
        let c = mailbox.receive();

        mailbox.deliver(msg(0));
        mailbox.deliver(msg(1));
        mailbox.deliver(msg(2));

        // Awaiting out of order must not change who got what.
        assert_eq!(number(&c.await.unwrap()), 2);
        assert_eq!(number(&a.await.unwrap()), 0);
        assert_eq!(number(&b.await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_swallow_message() {
        let mailbox = Mailbox::new();
        let abandoned = mailbox.receive();
        let kept = mailbox.receive();
        drop(abandoned);

        mailbox.deliver(msg(7));
        assert_eq!(number(&kept.await.unwrap()), 7);

        drop(mailbox.receive());
        mailbox.deliver(msg(8));
        assert_eq!(mailbox.queued_messages(), 1);
        assert_eq!(number(&mailbox.receive().await.unwrap()), 8);
    }

    #[tokio::test]
    async fn test_error_condition_is_delivered_in_order() {
        let mailbox = Mailbox::new();
        mailbox.deliver(msg(0));
        mailbox.deliver_error(Error::ChannelClosed("relay went away".into()));

        assert!(mailbox.receive().await.is_ok());
        assert!(matches!(mailbox.receive().await, Err(Error::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_takes_the_error_and_keeps_messages() {
        let mailbox = Mailbox::new();
        let mut failed = Box::pin(mailbox.failed());
        assert!(futures::poll!(&mut failed).is_pending());

        mailbox.deliver(msg(0));
        mailbox.deliver_error(Error::ChannelClosed("relay went away".into()));
        mailbox.deliver(msg(1));

        assert!(matches!(failed.await, Error::ChannelClosed(ref m) if m == "relay went away"));
        assert_eq!(mailbox.queued_messages(), 2);
        assert_eq!(number(&mailbox.receive().await.unwrap()), 0);
        assert_eq!(number(&mailbox.receive().await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_failed_after_a_receiver_took_the_error() {
        let mailbox = Mailbox::new();
        let waiting = mailbox.receive();
        mailbox.deliver_error(Error::Serialization(Message::from_json("{").unwrap_err()));

        assert!(matches!(waiting.await, Err(Error::Serialization(_))));
        // Still latched for anyone checking later.
        assert!(matches!(mailbox.failed().await, Error::ChannelClosed(ref m) if m.starts_with("Serialization error")));
        assert!(matches!(mailbox.failed().await, Error::ChannelClosed(_)));
    }

    #[test]
    fn test_pending_receive_stays_pending() {
        let mailbox = Mailbox::new();
        let mut pending = mailbox.receive();
        assert!((&mut pending).now_or_never().is_none());
        mailbox.deliver(msg(1));
        assert_eq!(number(&pending.now_or_never().unwrap().unwrap()), 1);
    }

    proptest! {
        /// `true` = deliver the next message, `false` = start a receive.
        #[test]
        fn test_every_message_received_once_in_order(
            ops in proptest::collection::vec(any::<bool>(), 0..64)
        ) {
            let mailbox = Mailbox::new();
            let mut delivered = 0usize;
            let mut receivers = Vec::new();

            for deliver in ops {
                if deliver {
                    mailbox.deliver(msg(delivered));
                    delivered += 1;
                } else {
                    receivers.push(mailbox.receive());
                }
                prop_assert!(mailbox.queued_messages() == 0 || mailbox.waiting_receivers() == 0);
            }
            // Balance both sides so every receiver can finish.
            while receivers.len() < delivered {
                receivers.push(mailbox.receive());
            }
            while delivered < receivers.len() {
                mailbox.deliver(msg(delivered));
                delivered += 1;
            }

            let got: Vec<usize> = receivers
                .into_iter()
                .map(|r| number(&r.now_or_never().unwrap().unwrap()))
                .collect();
            let expected: Vec<usize> = (0..got.len()).collect();
            prop_assert_eq!(got, expected);
            prop_assert_eq!(mailbox.queued_messages(), 0);
        }
    }
}
