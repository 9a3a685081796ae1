//! In-process fakes for driving two harness parties against each other

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use steeplechase_common::{Error, Message, Result};
use steeplechase_harness::{
    Channel, ContextEvent, ContextLauncher, ExecutionContext, Host, Mailbox, SignalingConnector,
    TestBridge,
};

/// Host that counts quit calls instead of exiting
#[derive(Default)]
pub struct CountingHost {
    quits: AtomicUsize,
}

impl CountingHost {
    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
}

impl Host for CountingHost {
    fn quit(&self) {
        self.quits.fetch_add(1, Ordering::SeqCst);
    }
}

/// A two-seat room that relays every message to the other seat's mailbox
#[derive(Default)]
pub struct LoopbackRoom {
    mailboxes: Mutex<Vec<Arc<Mailbox>>>,
    joined: Notify,
}

impl LoopbackRoom {
    pub fn connector(self: &Arc<Self>) -> Arc<dyn SignalingConnector> {
        Arc::new(LoopbackConnector { room: self.clone() })
    }
}

struct LoopbackConnector {
    room: Arc<LoopbackRoom>,
}

#[async_trait]
impl SignalingConnector for LoopbackConnector {
    async fn connect(&self, mailbox: Arc<Mailbox>) -> Result<Arc<dyn Channel>> {
        let seat = {
            let mut mailboxes = self.room.mailboxes.lock();
            if mailboxes.len() >= 2 {
                return Err(Error::RoomOverCapacity {
                    clients: mailboxes.len() as u32 + 1,
                });
            }
            mailboxes.push(mailbox);
            mailboxes.len() - 1
        };
        self.room.joined.notify_waiters();

        loop {
            let joined = self.room.joined.notified();
            if self.room.mailboxes.lock().len() == 2 {
                break;
            }
            joined.await;
        }

        Ok(Arc::new(LoopbackChannel {
            room: self.room.clone(),
            peer: 1 - seat,
        }))
    }
}

struct LoopbackChannel {
    room: Arc<LoopbackRoom>,
    peer: usize,
}

impl Channel for LoopbackChannel {
    fn send(&self, msg: &Message) -> Result<()> {
        let peer = self.room.mailboxes.lock()[self.peer].clone();
        peer.deliver(msg.clone());
        Ok(())
    }
}

/// Connector that fails immediately
pub struct FailingConnector(pub fn() -> Error);

#[async_trait]
impl SignalingConnector for FailingConnector {
    async fn connect(&self, _mailbox: Arc<Mailbox>) -> Result<Arc<dyn Channel>> {
        Err((self.0)())
    }
}

/// Launches in-process tests that trade an offer for an answer
#[derive(Default)]
pub struct OfferAnswerLauncher {
    launched: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    /// Paths whose body throws when run
    throwing: HashSet<String>,
    /// Contexts never report loading
    silent: bool,
}

impl OfferAnswerLauncher {
    pub fn throwing(paths: &[&str]) -> Self {
        Self {
            throwing: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ContextLauncher for OfferAnswerLauncher {
    fn launch(&self, path: &str, bridge: TestBridge) -> Result<Box<dyn ExecutionContext>> {
        self.launched.lock().push(path.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let (events_tx, events) = mpsc::unbounded_channel();
        if !self.silent {
            let _ = events_tx.send(ContextEvent::Loaded);
        }
        Ok(Box::new(OfferAnswerContext {
            bridge,
            throws: self.throwing.contains(path),
            events_tx,
            events,
            body: None,
            active: self.active.clone(),
            closed: false,
        }))
    }
}

struct OfferAnswerContext {
    bridge: TestBridge,
    throws: bool,
    events_tx: mpsc::UnboundedSender<ContextEvent>,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    body: Option<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl ExecutionContext for OfferAnswerContext {
    async fn next_event(&mut self) -> ContextEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| ContextEvent::Error("context gone".into()))
    }

    fn run_test(&mut self, is_initiator: bool) -> Result<()> {
        let bridge = self.bridge.clone();
        let events = self.events_tx.clone();
        let throws = self.throws;
        self.body = Some(tokio::spawn(async move {
            if throws {
                let _ = events.send(ContextEvent::Error("TypeError: pc is null".into()));
                return;
            }
            let event = match offer_answer(&bridge, is_initiator).await {
                Ok(()) => {
                    bridge.log_result(true, "offer/answer exchanged");
                    ContextEvent::Finished
                }
                Err(e) => ContextEvent::Error(e.to_string()),
            };
            let _ = events.send(event);
        }));
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(body) = self.body.take() {
            body.abort();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn offer_answer(bridge: &TestBridge, is_initiator: bool) -> Result<()> {
    let test = bridge.source().to_string();
    if is_initiator {
        bridge.send_message(&Message::new("offer").with_field("test", test.as_str()))?;
        let answer = bridge.wait_for_message().await?;
        expect(&answer, "answer", &test)
    } else {
        let offer = bridge.wait_for_message().await?;
        expect(&offer, "offer", &test)?;
        bridge.send_message(&Message::new("answer").with_field("test", test.as_str()))
    }
}

fn expect(msg: &Message, action: &str, test: &str) -> Result<()> {
    if msg.action == action && msg.test() == Some(test) {
        Ok(())
    } else {
        Err(Error::ProtocolMismatch(format!("expected {} for {}, got {}", action, test, msg)))
    }
}
