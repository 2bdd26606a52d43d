//! Async driver: owns a transport and a [`TalkieCore`], polls the transport
//! from one background task and sends whatever the core returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::{OutboundFrame, TalkieCore};
use crate::manifest::Manifest;
use crate::message::Message;
use crate::transport::{Transport, TransportError};

/// Receive poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub type SharedCore<T> = Arc<Mutex<TalkieCore<<T as Transport>::Address>>>;

pub struct JsonTalkie<T: Transport> {
    core: SharedCore<T>,
    transport: Arc<Mutex<T>>,
    poll_interval: Duration,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> JsonTalkie<T> {
    pub fn new(manifest: Manifest, transport: T) -> Self {
        Self::with_core(TalkieCore::new(manifest), transport)
    }

    pub fn with_core(core: TalkieCore<T::Address>, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport: Arc::new(Mutex::new(transport)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop: None,
            task: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Shared engine state, for inspection (drops, channel, cache).
    pub fn core(&self) -> SharedCore<T> {
        self.core.clone()
    }

    pub fn is_on(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Open the transport and start the receive task. No-op if already on.
    pub async fn on(&mut self) -> Result<(), TransportError> {
        if self.is_on() {
            return Ok(());
        }
        {
            let mut transport = self.transport.lock().await;
            transport.open()?;
            let description = transport.describe();
            let mut core = self.core.lock().await;
            log::info!("talker {} on {}", core.name(), description);
            core.set_socket_description(description);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);
        self.task = Some(tokio::spawn(listen(
            self.core.clone(),
            self.transport.clone(),
            self.poll_interval,
            stop_rx,
        )));
        Ok(())
    }

    /// Stop the receive task, wait for it, then close the transport. Safe to
    /// call more than once and after the task has already exited.
    pub async fn off(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("receive task ended abnormally: {}", e);
            }
        }
        self.transport.lock().await.close();
    }

    /// Send a message. True when every resulting frame went out (always true
    /// for messages dispatched locally).
    pub async fn talk(&self, message: Message) -> bool {
        let frames = self.core.lock().await.talk(message);
        let mut transport = self.transport.lock().await;
        send_all(&mut *transport, frames)
    }

    pub async fn port(&self) -> String {
        self.transport.lock().await.port()
    }

    pub async fn set_port(&self, port: &str) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        transport.set_port(port)?;
        let description = transport.describe();
        self.core.lock().await.set_socket_description(description);
        Ok(())
    }
}

impl<T: Transport> Drop for JsonTalkie<T> {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

fn send_all<T: Transport>(transport: &mut T, frames: Vec<OutboundFrame<T::Address>>) -> bool {
    let mut sent = true;
    for frame in frames {
        if let Err(e) = transport.send(&frame.bytes, frame.to.as_ref()) {
            log::warn!("send to {:?} failed: {}", frame.to, e);
            sent = false;
        }
    }
    sent
}

async fn listen<T: Transport>(
    core: SharedCore<T>,
    transport: Arc<Mutex<T>>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        let mut transport = transport.lock().await;
        let mut core = core.lock().await;
        core.tick();
        while let Some((bytes, from)) = transport.receive() {
            let frames = core.on_frame(&bytes, from);
            send_all(&mut *transport, frames);
        }
    }
    log::debug!("receive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use crate::protocol::{key, MessageCode, RogerCode};
    use crate::transport::SimLink;
    use std::sync::Mutex as StdMutex;

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }

    #[tokio::test]
    async fn call_over_sim_link() {
        let link = SimLink::new();
        let echoes: Arc<StdMutex<Vec<Message>>> = Arc::default();
        let log = echoes.clone();
        let mut main = JsonTalkie::new(
            Manifest::new("Main", "").on_echo(move |m| log.lock().unwrap().push(m.clone())),
            link.endpoint(),
        );
        let mut buzzer = JsonTalkie::new(
            Manifest::new("Buzzer", "Buzzes").run("buzz", "Buzz", |_| true),
            link.endpoint(),
        );
        main.on().await.unwrap();
        buzzer.on().await.unwrap();

        let call = Message::with_code(MessageCode::Run)
            .field(key::TO, "Buzzer")
            .field(key::NAME, "buzz");
        assert!(main.talk(call).await);
        assert!(wait_for(|| echoes.lock().unwrap().len() == 2).await);
        let last = echoes.lock().unwrap()[1].clone();
        assert_eq!(last.get(key::ROGER), Some(&Value::from(RogerCode::Roger)));

        main.off().await;
        buzzer.off().await;
    }

    #[tokio::test]
    async fn off_is_idempotent() {
        let link = SimLink::new();
        let mut talkie = JsonTalkie::new(Manifest::new("Main", ""), link.endpoint());
        talkie.off().await;
        talkie.on().await.unwrap();
        assert!(talkie.is_on());
        talkie.off().await;
        talkie.off().await;
        assert!(!talkie.is_on());
        let ping = Message::with_code(MessageCode::Ping).field(key::TO, "*");
        assert!(!talkie.talk(ping).await);
    }

    #[tokio::test]
    async fn socket_description_follows_port() {
        let link = SimLink::new();
        let mut talkie = JsonTalkie::new(Manifest::new("Main", ""), link.endpoint());
        talkie.on().await.unwrap();
        talkie.set_port("6001").await.unwrap();
        assert_eq!(talkie.port().await, "6001");
        talkie.off().await;
    }
}
