//! Host-driven API: TalkieCore takes frames and outgoing messages from the
//! host and returns the frames the host must send.

use std::collections::HashMap;

use crate::checksum::{self, Verification};
use crate::identity::{self, IdentityClock, MonotonicClock};
use crate::manifest::{Group, Manifest};
use crate::message::{Message, Value};
use crate::protocol::{key, ErrorCode, MessageCode, RogerCode, Source, SystemCode, BROADCAST};
use crate::wire;

/// Default retry window in identity units (milliseconds).
pub const DEFAULT_MAX_DELAY: u16 = 500;

/// Frame for the host to put on the transport. `to == None` means broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame<A> {
    pub bytes: Vec<u8>,
    pub to: Option<A>,
}

/// Last request we originated; echoes are only accepted for it. Requests
/// received from other talkers are answered but never tracked here, so an
/// incoming request cannot invalidate the echo we are waiting for.
#[derive(Debug, Clone, Copy)]
struct Original {
    code: MessageCode,
    identity: u16,
}

/// The one request that may be resent after a checksum error.
#[derive(Debug, Clone)]
struct RetrySlot {
    message: Message,
    identity: u16,
    resends: u8,
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("missing or unknown message code")]
    Code,
    #[error("missing or out of range identity")]
    Identity,
    #[error("own message")]
    OwnMessage,
    #[error("addressed to someone else")]
    NotForMe,
}

/// Protocol engine. Owns the address cache, the retry slot, the channel and
/// the mute flag; the host owns the transport.
pub struct TalkieCore<A> {
    manifest: Manifest,
    clock: Box<dyn IdentityClock>,
    channel: u64,
    muted: bool,
    drops: u64,
    max_delay: u16,
    socket: String,
    board: String,
    devices: HashMap<String, A>,
    original: Option<Original>,
    recoverable: Option<RetrySlot>,
    outbox: Vec<OutboundFrame<A>>,
}

impl<A: Clone> TalkieCore<A> {
    pub fn new(manifest: Manifest) -> Self {
        Self::with_clock(manifest, MonotonicClock::new())
    }

    pub fn with_clock(manifest: Manifest, clock: impl IdentityClock + 'static) -> Self {
        Self {
            manifest,
            clock: Box::new(clock),
            channel: 0,
            muted: false,
            drops: 0,
            max_delay: DEFAULT_MAX_DELAY,
            socket: String::new(),
            board: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            devices: HashMap::new(),
            original: None,
            recoverable: None,
            outbox: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.manifest.name()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn channel(&self) -> u64 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u64) {
        self.channel = channel;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Inbound frames dropped so far (decode, validation and checksum failures).
    pub fn drops(&self) -> u64 {
        self.drops
    }

    pub fn max_delay(&self) -> u16 {
        self.max_delay
    }

    pub fn set_max_delay(&mut self, max_delay: u16) {
        self.max_delay = max_delay;
    }

    /// Transport description reported by SYS SOCKET.
    pub fn set_socket_description(&mut self, description: impl Into<String>) {
        self.socket = description.into();
    }

    /// Board description reported by SYS BOARD.
    pub fn set_board(&mut self, board: impl Into<String>) {
        self.board = board.into();
    }

    /// Cached transport address of a talker.
    pub fn device_address(&self, name: &str) -> Option<&A> {
        self.devices.get(name)
    }

    /// Whether a request is waiting for a possible resend.
    pub fn has_recoverable(&self) -> bool {
        self.recoverable.is_some()
    }

    /// Fresh identity from the engine clock.
    pub fn message_id(&self) -> u16 {
        self.clock.now()
    }

    /// Clear the retry slot once it is older than the max delay.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if let Some(slot) = &self.recoverable {
            if identity::age(now, slot.identity) > self.max_delay {
                log::debug!("retry slot {} expired", slot.identity);
                self.recoverable = None;
            }
        }
    }

    /// Send a message. The `b` field, if any, selects the source and is removed.
    pub fn talk(&mut self, mut message: Message) -> Vec<OutboundFrame<A>> {
        let source = message
            .remove(key::SOURCE)
            .and_then(|v| v.as_integer())
            .and_then(|v| Source::try_from(v).ok())
            .unwrap_or_default();
        self.talk_from(message, source)
    }

    pub fn talk_from(&mut self, message: Message, source: Source) -> Vec<OutboundFrame<A>> {
        self.transmit(message, source, None);
        std::mem::take(&mut self.outbox)
    }

    /// Process one received frame. `from` is the transport address it came from.
    pub fn on_frame(&mut self, bytes: &[u8], from: Option<A>) -> Vec<OutboundFrame<A>> {
        self.tick();
        self.intake(bytes, from);
        std::mem::take(&mut self.outbox)
    }

    fn intake(&mut self, bytes: &[u8], from: Option<A>) {
        log::trace!("frame in: {}", String::from_utf8_lossy(bytes));
        let mut buf = bytes.to_vec();
        let verification = checksum::verify_and_strip(&mut buf);
        let source = if verification.is_present() {
            Source::Remote
        } else {
            Source::Local
        };

        let mut message = match wire::decode(&buf) {
            Ok(message) => message,
            Err(e) => {
                self.drops += 1;
                log::debug!("dropped frame: {}", e);
                return;
            }
        };

        let validated = self.validate(&message);
        if let Verification::Invalid { claimed, computed } = verification {
            self.drops += 1;
            log::debug!(
                "checksum mismatch from {:?}: claimed {:?}, computed {}",
                message.from_name(),
                claimed,
                computed
            );
            // only the talker the frame was meant for asks for a resend
            if validated.is_ok() {
                self.report_checksum(&message, from);
            }
            return;
        }

        let code = match validated {
            Ok(code) => code,
            Err(reason) => {
                self.drops += 1;
                log::debug!("dropped frame: {}", reason);
                return;
            }
        };
        let identity = message.identity();

        if code == MessageCode::Echo && !message.contains("0") {
            if let (Some(original), Some(identity)) = (self.original, identity) {
                if original.code == MessageCode::Ping && original.identity == identity {
                    let delay = identity::age(self.clock.now(), identity);
                    message.set("0", u64::from(delay));
                }
            }
        }

        if is_checksum_error(code, &message) {
            self.retry(identity);
        }

        if let (Some(name), Some(address)) = (message.from_name(), from.clone()) {
            self.devices.insert(name.to_string(), address);
        }

        self.process_message(message, source, from);
    }

    fn validate(&self, message: &Message) -> Result<MessageCode, Rejection> {
        let code = message.code().ok_or(Rejection::Code)?;
        // a checksum error may leave the identity out: it then names our last request
        match (message.contains(key::IDENTITY), message.identity()) {
            (_, Some(_)) => {}
            (false, None) if is_checksum_error(code, message) => {}
            _ => return Err(Rejection::Identity),
        }
        if message.from_name() == Some(self.name()) {
            return Err(Rejection::OwnMessage);
        }
        match message.get(key::TO) {
            None => Ok(code),
            Some(Value::Integer(channel)) if *channel == self.channel => Ok(code),
            Some(Value::Text(to)) if to == BROADCAST || to == self.name() => Ok(code),
            Some(_) => Err(Rejection::NotForMe),
        }
    }

    /// Tell the sender its frame arrived damaged. Only for otherwise valid
    /// frames that name their sender and are not errors themselves.
    fn report_checksum(&mut self, damaged: &Message, from: Option<A>) {
        let Some(sender) = damaged.from_name() else {
            return;
        };
        if damaged.code() == Some(MessageCode::Error) {
            return;
        }
        let mut error = Message::with_code(MessageCode::Error)
            .field(key::ERROR, ErrorCode::Checksum)
            .field(key::FROM, sender);
        if let Some(identity) = damaged.identity() {
            error.set(key::IDENTITY, identity);
        }
        self.transmit(error, Source::Remote, from);
    }

    /// Resend the recoverable message once; a second checksum error gives up.
    /// An error without identity refers to whatever is in the slot.
    fn retry(&mut self, identity: Option<u16>) {
        let Some(slot) = self.recoverable.as_mut() else {
            return;
        };
        if identity.map_or(false, |identity| identity != slot.identity) {
            return;
        }
        let identity = slot.identity;
        if slot.resends > 0 {
            log::debug!("second checksum error for {}, giving up", identity);
            self.recoverable = None;
            return;
        }
        slot.resends += 1;
        let message = slot.message.clone();
        log::debug!("resending {}", identity);
        self.send_remote(message, None);
    }

    fn process_message(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let Some(code) = message.code() else {
            log::debug!("unknown message code {:?}", message.get(key::MESSAGE));
            return;
        };
        if code.is_request() {
            message.set(key::MESSAGE, MessageCode::Echo);
            message.set(key::ORIGINAL, code);
        }
        match code {
            MessageCode::Run => self.handle_run(message, source, reply_to),
            MessageCode::Set => self.handle_set(message, source, reply_to),
            MessageCode::Get => self.handle_get(message, source, reply_to),
            MessageCode::List => {
                let listing: Vec<Message> = self
                    .manifest
                    .entries()
                    .into_iter()
                    .map(|entry| {
                        let mut item = message.clone();
                        item.set(key::ACTION, entry.group.code());
                        item.set(key::NAME, entry.name);
                        item.set(key::INDEX, entry.index);
                        item.set(key::DESCRIPTION, entry.description);
                        item
                    })
                    .collect();
                for item in listing {
                    self.reply(item, code, source, reply_to.clone());
                }
            }
            MessageCode::Talk => {
                message.set(key::DESCRIPTION, self.manifest.description().to_string());
                self.reply(message, code, source, reply_to);
            }
            MessageCode::Channel => {
                if let Some(channel) = message.get_integer(key::VALUE) {
                    self.channel = channel;
                }
                message.set(key::VALUE, self.channel);
                self.reply(message, code, source, reply_to);
            }
            MessageCode::Ping => self.reply(message, code, source, reply_to),
            MessageCode::Sys => self.handle_sys(message, source, reply_to),
            MessageCode::Echo => {
                let identity = message.identity();
                let expected = self.original.map(|o| o.identity);
                if identity.is_none() || identity != expected {
                    log::debug!("ignored echo {:?}, expecting {:?}", identity, expected);
                    return;
                }
                if self.recoverable.as_ref().map(|s| s.identity) == identity {
                    self.recoverable = None;
                }
                self.manifest.deliver_echo(&message);
            }
            MessageCode::Error => {
                self.manifest.deliver_error(&message);
            }
            MessageCode::Noise => {}
        }
    }

    fn handle_run(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let Some(index) = self.manifest.lookup(Group::Run, &message) else {
            message.set(key::ROGER, RogerCode::SayAgain);
            return self.reply(message, MessageCode::Run, source, reply_to);
        };
        self.acknowledge(&mut message, Group::Run, index, source, reply_to.clone());
        let done = self.manifest.call_run(index, &mut message).unwrap_or(false);
        message.set(key::ROGER, roger(done));
        self.reply(message, MessageCode::Run, source, reply_to);
    }

    fn handle_set(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let target = self.manifest.lookup(Group::Set, &message);
        let (Some(index), Some(value)) = (target, message.get_integer(key::VALUE)) else {
            message.set(key::ROGER, RogerCode::SayAgain);
            return self.reply(message, MessageCode::Set, source, reply_to);
        };
        self.acknowledge(&mut message, Group::Set, index, source, reply_to.clone());
        let done = self
            .manifest
            .call_set(index, &mut message, value)
            .unwrap_or(false);
        message.set(key::ROGER, roger(done));
        self.reply(message, MessageCode::Set, source, reply_to);
    }

    fn handle_get(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let Some(index) = self.manifest.lookup(Group::Get, &message) else {
            message.set(key::ROGER, RogerCode::SayAgain);
            return self.reply(message, MessageCode::Get, source, reply_to);
        };
        self.acknowledge(&mut message, Group::Get, index, source, reply_to.clone());
        if let Some(value) = self.manifest.call_get(index, &mut message) {
            message.set(key::VALUE, value);
        }
        message.set(key::ROGER, RogerCode::Roger);
        self.reply(message, MessageCode::Get, source, reply_to);
    }

    /// Name the entry on the reply and send the immediate, roger-less echo.
    fn acknowledge(
        &mut self,
        message: &mut Message,
        group: Group,
        index: usize,
        source: Source,
        reply_to: Option<A>,
    ) {
        if let Some(name) = self.manifest.entry_name(group, index) {
            message.set(key::NAME, name.to_string());
        }
        message.remove(key::ROGER);
        self.reply(message.clone(), group.code(), source, reply_to);
    }

    fn handle_sys(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let operation = message
            .get_integer(key::SYSTEM)
            .and_then(|s| SystemCode::try_from(s).ok());
        match operation {
            Some(SystemCode::Board) => message.set(key::DESCRIPTION, self.board.clone()),
            Some(SystemCode::Drops) => message.set(key::VALUE, self.drops),
            Some(SystemCode::Delay) => {
                if let Some(delay) = message.get_integer(key::VALUE) {
                    self.max_delay = u16::try_from(delay).unwrap_or(u16::MAX);
                }
                message.set(key::VALUE, self.max_delay);
            }
            Some(SystemCode::Mute) => {
                self.muted = true;
                message.set(key::VALUE, 1u64);
            }
            Some(SystemCode::Unmute) => {
                self.muted = false;
                message.set(key::VALUE, 0u64);
            }
            Some(SystemCode::Muted) => message.set(key::VALUE, u64::from(self.muted)),
            Some(SystemCode::Socket) => message.set(key::DESCRIPTION, self.socket.clone()),
            Some(SystemCode::Talker) => {
                message.set(key::NAME, self.manifest.name().to_string());
                message.set(key::DESCRIPTION, self.manifest.description().to_string());
            }
            Some(SystemCode::Manifesto) => {
                for (n, count) in self.manifest.counts().into_iter().enumerate() {
                    message.set(&crate::protocol::extra_key(n), count);
                }
            }
            None => message.set(key::ROGER, RogerCode::SayAgain),
        }
        self.reply(message, MessageCode::Sys, source, reply_to);
    }

    /// Send a reply unless muted. Replies to SYS always go out.
    fn reply(&mut self, message: Message, original: MessageCode, source: Source, reply_to: Option<A>) {
        if self.muted && original != MessageCode::Sys {
            log::trace!("muted, {} reply suppressed", original);
            return;
        }
        self.transmit(message, source, reply_to);
    }

    /// Address, identify and send (or loop back) a message.
    fn transmit(&mut self, mut message: Message, source: Source, reply_to: Option<A>) {
        let me = self.name().to_string();
        if let Some(from) = message.from_name() {
            if from != me {
                let from = from.to_string();
                message.set(key::TO, from);
            }
        }
        message.set(key::FROM, me);

        if message.identity().is_none() {
            let identity = self.clock.now();
            message.set(key::IDENTITY, identity);
            if let Some(code) = message.code().filter(|c| c.is_request()) {
                self.original = Some(Original { code, identity });
                if source == Source::Remote {
                    self.recoverable = Some(RetrySlot {
                        message: message.clone(),
                        identity,
                        resends: 0,
                    });
                }
            }
        }

        match source {
            Source::Here => self.process_message(message, Source::Here, None),
            Source::Remote => self.send_remote(message, reply_to),
            Source::Local => {
                message.remove(key::CHECKSUM);
                match wire::encode(&message) {
                    Ok(bytes) => self.queue(bytes, &message, reply_to),
                    Err(e) => log::warn!("cannot encode message: {}", e),
                }
            }
        }
    }

    /// Encode with the checksum field first, stamp it, and queue the frame.
    fn send_remote(&mut self, mut message: Message, reply_to: Option<A>) {
        message.set_first(key::CHECKSUM, 0u64);
        let mut bytes = match wire::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("cannot encode message: {}", e);
                return;
            }
        };
        if let Err(e) = checksum::stamp(&mut bytes) {
            log::warn!("cannot stamp checksum: {}", e);
            return;
        }
        self.queue(bytes, &message, reply_to);
    }

    fn queue(&mut self, bytes: Vec<u8>, message: &Message, reply_to: Option<A>) {
        let to = reply_to.or_else(|| {
            message
                .get_text(key::TO)
                .and_then(|name| self.devices.get(name))
                .cloned()
        });
        log::trace!("frame out: {}", String::from_utf8_lossy(&bytes));
        self.outbox.push(OutboundFrame { bytes, to });
    }
}

fn is_checksum_error(code: MessageCode, message: &Message) -> bool {
    code == MessageCode::Error
        && message.get_integer(key::ERROR) == Some(ErrorCode::Checksum.as_u64())
}

fn roger(done: bool) -> RogerCode {
    if done {
        RogerCode::Roger
    } else {
        RogerCode::Negative
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field;
    use crate::identity::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const MAIN: u16 = 1;
    const BUZZER: u16 = 2;

    type Seen = Arc<Mutex<Vec<Message>>>;

    struct Peer {
        core: TalkieCore<u16>,
        clock: ManualClock,
        echoes: Seen,
        errors: Seen,
        calls: Arc<AtomicUsize>,
    }

    fn peer(name: &str, start: u16) -> Peer {
        let clock = ManualClock::new(start);
        let echoes: Seen = Arc::default();
        let errors: Seen = Arc::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (echo_log, error_log, counter) = (echoes.clone(), errors.clone(), calls.clone());
        let manifest = Manifest::new(name, "A simple talker")
            .run("buzz", "Buzz once", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .run("fail", "Always fails", |_| false)
            .set("duration", "Buzz duration", |_, _| true)
            .get("duration", "Buzz duration", |_| Value::Integer(500))
            .on_echo(move |m| echo_log.lock().unwrap().push(m.clone()))
            .on_error(move |m| error_log.lock().unwrap().push(m.clone()));
        Peer {
            core: TalkieCore::with_clock(manifest, clock.clone()),
            clock,
            echoes,
            errors,
            calls,
        }
    }

    fn decoded(frame: &OutboundFrame<u16>) -> Message {
        let mut bytes = frame.bytes.clone();
        checksum::strip(&mut bytes);
        wire::decode(&bytes).unwrap()
    }

    fn request(code: MessageCode, to: &str) -> Message {
        Message::with_code(code).field(key::TO, to)
    }

    /// Deliver every frame to `to` and collect what it sends back.
    fn deliver(to: &mut Peer, frames: &[OutboundFrame<u16>], from: u16) -> Vec<OutboundFrame<u16>> {
        frames
            .iter()
            .flat_map(|f| to.core.on_frame(&f.bytes, Some(from)))
            .collect()
    }

    #[test]
    fn call_unknown_action_says_again() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::NAME, "sing"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to, None);

        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 1);
        let reply = decoded(&replies[0]);
        assert_eq!(reply.code(), Some(MessageCode::Echo));
        assert_eq!(reply.get_integer(key::ORIGINAL), Some(0));
        assert_eq!(reply.get_integer(key::ROGER), Some(RogerCode::SayAgain.as_u64()));
        assert_eq!(reply.get_text(key::TO), Some("Main"));
        assert_eq!(replies[0].to, Some(MAIN));
        assert_eq!(buzzer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn call_known_action_acks_then_rogers() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::NAME, "buzz"));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 2);
        let (ack, done) = (decoded(&replies[0]), decoded(&replies[1]));
        assert!(!ack.contains(key::ROGER));
        assert_eq!(done.get_integer(key::ROGER), Some(RogerCode::Roger.as_u64()));
        assert_eq!(ack.identity(), Some(100));
        assert_eq!(buzzer.calls.load(Ordering::SeqCst), 1);

        assert!(main.core.has_recoverable());
        assert!(deliver(&mut main, &replies, BUZZER).is_empty());
        assert_eq!(main.echoes.lock().unwrap().len(), 2);
        assert!(!main.core.has_recoverable());
        assert_eq!(main.core.device_address("Buzzer"), Some(&BUZZER));
    }

    #[test]
    fn call_by_index_and_negative() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::INDEX, 1u64));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 2);
        let done = decoded(&replies[1]);
        assert_eq!(done.get_text(key::NAME), Some("fail"));
        assert_eq!(done.get_integer(key::ROGER), Some(RogerCode::Negative.as_u64()));
    }

    #[test]
    fn set_and_get() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main.core.talk(
            request(MessageCode::Set, "Buzzer")
                .field(key::NAME, "duration")
                .field(key::VALUE, 750u64),
        );
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 2);
        assert_eq!(decoded(&replies[1]).get_integer(key::ROGER), Some(0));

        let frames = main
            .core
            .talk(request(MessageCode::Set, "Buzzer").field(key::NAME, "duration"));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 1);
        assert_eq!(decoded(&replies[0]).get_integer(key::ROGER), Some(1));

        let frames = main
            .core
            .talk(request(MessageCode::Get, "Buzzer").field(key::NAME, "duration"));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 2);
        let value = decoded(&replies[1]);
        assert_eq!(value.get_integer(key::VALUE), Some(500));
        assert_eq!(value.get_integer(key::ORIGINAL), Some(MessageCode::Get.as_u64()));
    }

    #[test]
    fn list_emits_one_echo_per_entry() {
        let mut main = peer("Main", 100);
        let mut other = TalkieCore::<u16>::with_clock(
            Manifest::new("Buzzer", "")
                .run("buzz", "Buzz", |_| true)
                .run("print", "Print", |_| true)
                .get("duration", "Duration", |_| Value::Integer(1)),
            ManualClock::new(0),
        );
        let frames = main.core.talk(request(MessageCode::List, "*"));
        let replies = other.on_frame(&frames[0].bytes, Some(MAIN));
        assert_eq!(replies.len(), 3);
        let tagged: Vec<_> = replies
            .iter()
            .map(decoded)
            .map(|m| {
                (
                    m.get_integer(key::ACTION).unwrap(),
                    m.get_text(key::NAME).unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            tagged,
            vec![
                (0, "buzz".to_string()),
                (0, "print".to_string()),
                (2, "duration".to_string()),
            ]
        );
    }

    #[test]
    fn checksum_error_resends_once() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::NAME, "buzz"));
        let sent = frames[0].bytes.clone();

        let damage = |bytes: &[u8]| {
            let mut bytes = bytes.to_vec();
            let claimed = field::read_integer(&bytes, key::CHECKSUM);
            field::replace_integer(&mut bytes, key::CHECKSUM, (claimed + 1) % 65536).unwrap();
            bytes
        };

        let errors = buzzer.core.on_frame(&damage(&sent), Some(MAIN));
        assert_eq!(errors.len(), 1);
        assert_eq!(buzzer.calls.load(Ordering::SeqCst), 0);
        let error = decoded(&errors[0]);
        assert_eq!(error.code(), Some(MessageCode::Error));
        assert_eq!(error.get_integer(key::ERROR), Some(ErrorCode::Checksum.as_u64()));
        assert_eq!(error.get_text(key::TO), Some("Main"));
        assert_eq!(error.identity(), Some(100));
        assert_eq!(errors[0].to, Some(MAIN));

        let resent = deliver(&mut main, &errors, BUZZER);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].bytes, sent);
        assert_eq!(main.errors.lock().unwrap().len(), 1);

        let errors = buzzer.core.on_frame(&damage(&resent[0].bytes), Some(MAIN));
        assert!(deliver(&mut main, &errors, BUZZER).is_empty());
        assert!(!main.core.has_recoverable());
        assert_eq!(buzzer.core.drops(), 2);
    }

    #[test]
    fn ping_echo_carries_round_trip_delay() {
        let mut main = peer("Main", 65530);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main.core.talk(request(MessageCode::Ping, "Buzzer"));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 1);
        main.clock.advance(37);
        deliver(&mut main, &replies, BUZZER);
        let echoes = main.echoes.lock().unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].get_integer("0"), Some(37));
    }

    #[test]
    fn channel_addressing() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main
            .core
            .talk(request(MessageCode::Channel, "*").field(key::VALUE, 7u64));
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(buzzer.core.channel(), 7);
        assert_eq!(decoded(&replies[0]).get_integer(key::VALUE), Some(7));

        let to_channel = Message::with_code(MessageCode::Talk).field(key::TO, 7u64);
        let frames = main.core.talk(to_channel);
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(
            decoded(&replies[0]).get_text(key::DESCRIPTION),
            Some("A simple talker")
        );

        let other_channel = Message::with_code(MessageCode::Talk).field(key::TO, 3u64);
        let frames = main.core.talk(other_channel);
        assert!(deliver(&mut buzzer, &frames, MAIN).is_empty());
    }

    #[test]
    fn invalid_frames_are_dropped_silently() {
        let mut buzzer = peer("Buzzer", 900);
        let frames: [&[u8]; 5] = [
            br#"{"m":5,"t":"Other","i":3,"f":"Main"}"#,
            br#"{"m":42,"i":3,"f":"Main"}"#,
            br#"{"m":5,"f":"Main"}"#,
            br#"{"m":5,"i":3,"f":"Buzzer"}"#,
            b"not json",
        ];
        for frame in frames {
            assert!(buzzer.core.on_frame(frame, Some(MAIN)).is_empty());
        }
        assert_eq!(buzzer.core.drops(), 5);
        assert!(buzzer.core.device_address("Main").is_none());
    }

    #[test]
    fn local_mode_has_no_checksum() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let frames = main.core.talk_from(request(MessageCode::Talk, "Buzzer"), Source::Local);
        assert!(field::locate_colon(&frames[0].bytes, key::CHECKSUM).is_none());
        assert!(!main.core.has_recoverable());
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(replies.len(), 1);
        assert!(field::locate_colon(&replies[0].bytes, key::CHECKSUM).is_none());
    }

    #[test]
    fn here_loops_back_without_transport() {
        let mut main = peer("Main", 100);
        let message = request(MessageCode::Run, "Main")
            .field(key::NAME, "buzz")
            .field(key::SOURCE, Source::Here);
        assert!(main.core.talk(message).is_empty());
        assert_eq!(main.calls.load(Ordering::SeqCst), 1);
        assert_eq!(main.echoes.lock().unwrap().len(), 2);
        assert!(!main.core.has_recoverable());
    }

    #[test]
    fn retry_slot_expires() {
        let mut main = peer("Main", 65300);
        main.core.talk(request(MessageCode::Talk, "Buzzer"));
        main.clock.advance(500);
        main.core.tick();
        assert!(main.core.has_recoverable());
        main.clock.advance(1);
        main.core.tick();
        assert!(!main.core.has_recoverable());
    }

    #[test]
    fn mute_suppresses_all_but_sys() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let mute = request(MessageCode::Sys, "Buzzer").field(key::SYSTEM, SystemCode::Mute);
        let frames = main.core.talk(mute);
        assert_eq!(deliver(&mut buzzer, &frames, MAIN).len(), 1);
        assert!(buzzer.core.is_muted());

        let frames = main.core.talk(request(MessageCode::Talk, "Buzzer"));
        assert!(deliver(&mut buzzer, &frames, MAIN).is_empty());

        let muted = request(MessageCode::Sys, "Buzzer").field(key::SYSTEM, SystemCode::Muted);
        let frames = main.core.talk(muted);
        let replies = deliver(&mut buzzer, &frames, MAIN);
        assert_eq!(decoded(&replies[0]).get_integer(key::VALUE), Some(1));
    }

    #[test]
    fn sys_queries() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        buzzer.core.set_socket_description("SimLink(node=2)");

        let ask = |main: &mut Peer, buzzer: &mut Peer, op: Message| {
            let frames = main.core.talk(op);
            let replies = deliver(buzzer, &frames, MAIN);
            assert_eq!(replies.len(), 1);
            decoded(&replies[0])
        };

        let sys = |code: SystemCode| request(MessageCode::Sys, "Buzzer").field(key::SYSTEM, code);

        let reply = ask(&mut main, &mut buzzer, sys(SystemCode::Socket));
        assert_eq!(reply.get_text(key::DESCRIPTION), Some("SimLink(node=2)"));

        let reply = ask(&mut main, &mut buzzer, sys(SystemCode::Delay).field(key::VALUE, 800u64));
        assert_eq!(reply.get_integer(key::VALUE), Some(800));
        assert_eq!(buzzer.core.max_delay(), 800);

        let reply = ask(&mut main, &mut buzzer, sys(SystemCode::Manifesto));
        assert_eq!(reply.get_integer("0"), Some(2));
        assert_eq!(reply.get_integer("1"), Some(1));
        assert_eq!(reply.get_integer("2"), Some(1));

        let reply = ask(&mut main, &mut buzzer, sys(SystemCode::Talker));
        assert_eq!(reply.get_text(key::NAME), Some("Buzzer"));

        let reply = ask(&mut main, &mut buzzer, request(MessageCode::Sys, "Buzzer"));
        assert_eq!(reply.get_integer(key::ROGER), Some(RogerCode::SayAgain.as_u64()));

        let reply = ask(&mut main, &mut buzzer, sys(SystemCode::Drops));
        assert_eq!(reply.get_integer(key::VALUE), Some(0));
    }

    #[test]
    fn stale_echo_is_ignored() {
        let mut main = peer("Main", 100);
        let stale = br#"{"m":8,"o":5,"t":"Main","i":4,"f":"Buzzer"}"#;
        main.core.talk(request(MessageCode::Talk, "Buzzer"));
        assert!(main.core.on_frame(stale, Some(BUZZER)).is_empty());
        assert!(main.echoes.lock().unwrap().is_empty());
        assert!(main.core.has_recoverable());
    }

    fn damaged(bytes: &[u8]) -> Vec<u8> {
        let mut bytes = bytes.to_vec();
        let claimed = field::read_integer(&bytes, key::CHECKSUM);
        field::replace_integer(&mut bytes, key::CHECKSUM, (claimed + 1) % 65536).unwrap();
        bytes
    }

    #[test]
    fn damaged_frame_is_reported_only_by_its_addressee() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let mut other = peer("Other", 300);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::NAME, "buzz"));
        let bad = damaged(&frames[0].bytes);

        assert!(other.core.on_frame(&bad, Some(MAIN)).is_empty());
        assert_eq!(other.core.drops(), 1);
        let errors = buzzer.core.on_frame(&bad, Some(MAIN));
        assert_eq!(errors.len(), 1);

        let resent = deliver(&mut main, &errors, BUZZER);
        assert_eq!(resent.len(), 1);
        assert!(deliver(&mut other, &resent, MAIN).is_empty());
        let replies = deliver(&mut buzzer, &resent, MAIN);
        assert_eq!(replies.len(), 2);
        assert_eq!(buzzer.calls.load(Ordering::SeqCst), 1);
        assert!(deliver(&mut main, &replies, BUZZER).is_empty());
        assert!(!main.core.has_recoverable());
    }

    #[test]
    fn nested_checksum_key_does_not_select_remote_mode() {
        let mut buzzer = peer("Buzzer", 900);
        let frame = br#"{"m":0,"t":"Buzzer","n":"buzz","i":5,"f":"Main","0":{"c":7}}"#;
        let replies = buzzer.core.on_frame(frame, Some(MAIN));
        assert_eq!(replies.len(), 2);
        assert_eq!(buzzer.core.drops(), 0);
        assert_eq!(buzzer.calls.load(Ordering::SeqCst), 1);
        for reply in &replies {
            assert!(field::locate_colon(&reply.bytes, key::CHECKSUM).is_none());
            assert_eq!(wire::decode(&reply.bytes).unwrap().code(), Some(MessageCode::Echo));
        }
    }

    #[test]
    fn checksum_error_without_identity_resends_pending_request() {
        let mut main = peer("Main", 100);
        let frames = main
            .core
            .talk(request(MessageCode::Run, "Buzzer").field(key::NAME, "buzz"));
        let error = format!(
            r#"{{"m":9,"e":{},"t":"Main","f":"Buzzer"}}"#,
            ErrorCode::Checksum.as_u64()
        );
        let resent = main.core.on_frame(error.as_bytes(), Some(BUZZER));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].bytes, frames[0].bytes);
        assert_eq!(main.errors.lock().unwrap().len(), 1);

        assert!(main
            .core
            .on_frame(br#"{"m":9,"t":"Main","f":"Buzzer"}"#, Some(BUZZER))
            .is_empty());
        assert_eq!(main.core.drops(), 1);
    }

    #[test]
    fn incoming_request_keeps_our_pending_original() {
        let mut main = peer("Main", 100);
        let mut buzzer = peer("Buzzer", 900);
        let ping = main.core.talk(request(MessageCode::Ping, "Buzzer"));
        let pong = deliver(&mut buzzer, &ping, MAIN);

        let talk = buzzer.core.talk(request(MessageCode::Talk, "Main"));
        assert_eq!(deliver(&mut main, &talk, BUZZER).len(), 1);

        assert!(deliver(&mut main, &pong, BUZZER).is_empty());
        let echoes = main.echoes.lock().unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].get_integer(key::ORIGINAL), Some(MessageCode::Ping.as_u64()));
    }
}
