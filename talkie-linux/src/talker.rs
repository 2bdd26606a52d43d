//! Demo capability table: a buzzer with a settable duration, plus logging of
//! whatever echoes and errors come back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use talkie_core::{key, ErrorCode, Manifest, Message, MessageCode, RogerCode, Value, BROADCAST};

/// Buzz duration in milliseconds until set otherwise.
const DEFAULT_DURATION_MS: u64 = 500;

pub fn manifest(name: &str, description: &str) -> Manifest {
    let duration = Arc::new(AtomicU64::new(DEFAULT_DURATION_MS));
    let (print, set, get) = (duration.clone(), duration.clone(), duration.clone());
    Manifest::new(name, description)
        .run("buzz", "Triggers a buzzing sound", move |_| {
            log::info!("BUZZING for {} ms", duration.load(Ordering::Relaxed));
            true
        })
        .run("print", "Prints the duration on the device", move |_| {
            log::info!("duration is {} ms", print.load(Ordering::Relaxed));
            true
        })
        .set("duration", "Sets the buzzing duration in ms", move |_, ms| {
            set.store(ms, Ordering::Relaxed);
            true
        })
        .get("duration", "Gets the buzzing duration in ms", move |_| {
            Value::Integer(get.load(Ordering::Relaxed))
        })
        .on_echo(|m| log::info!("{}", describe_echo(m)))
        .on_error(|m| log::warn!("{}", describe_error(m)))
}

/// One log line for an echo: `[from original name] roger/value/description`.
pub fn describe_echo(message: &Message) -> String {
    let from = message.from_name().unwrap_or("?");
    let original = message
        .get_integer(key::ORIGINAL)
        .and_then(|o| MessageCode::try_from(o).ok())
        .map_or("echo", MessageCode::name);
    let head = match message.get_text(key::NAME) {
        Some(name) => format!("[{} {} {}]", from, original, name),
        None => format!("[{} {}]", from, original),
    };
    let roger = message
        .get_integer(key::ROGER)
        .and_then(|g| RogerCode::try_from(g).ok());
    let detail = if let Some(roger) = roger {
        roger.name().to_uppercase()
    } else if let Some(value) = message.get(key::VALUE) {
        value.to_string()
    } else if let Some(description) = message.get_text(key::DESCRIPTION) {
        description.to_string()
    } else if let Some(delay) = message.get_integer("0") {
        format!("{} ms", delay)
    } else {
        String::new()
    };
    format!("{}\t{}", head, detail).trim_end().to_string()
}

pub fn describe_error(message: &Message) -> String {
    let from = message.from_name().unwrap_or("?");
    match message
        .get_integer(key::ERROR)
        .and_then(|e| ErrorCode::try_from(e).ok())
    {
        Some(kind) => format!("[{}]\tERROR\t{}", from, kind),
        None => format!("[{}]\tunknown error", from),
    }
}

/// The periodic broadcasts this talker makes when left alone.
pub fn canned_message(rng: &mut impl Rng) -> Message {
    let canned = [
        Message::with_code(MessageCode::List).field(key::TO, BROADCAST),
        Message::with_code(MessageCode::Run)
            .field(key::NAME, "buzz")
            .field(key::TO, "Buzzer"),
        Message::with_code(MessageCode::Run)
            .field(key::NAME, "on")
            .field(key::TO, "Buzzer"),
        Message::with_code(MessageCode::Ping).field(key::TO, BROADCAST),
    ];
    let pick = rng.gen_range(0..canned.len());
    canned[pick].clone()
}
