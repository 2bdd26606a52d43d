//! JsonTalkie wire protocol: field keys and the closed code sets they carry.

use std::fmt;

use crate::message::Value;

/// Field keys. All keys are single characters except the numbered extra
/// payload keys (see [`extra_key`]).
pub mod key {
    pub const CHECKSUM: &str = "c";
    pub const IDENTITY: &str = "i";
    pub const MESSAGE: &str = "m";
    pub const ORIGINAL: &str = "o";
    pub const FROM: &str = "f";
    pub const TO: &str = "t";
    pub const SYSTEM: &str = "s";
    pub const ERROR: &str = "e";
    pub const VALUE: &str = "v";
    pub const REPLY: &str = "r";
    pub const ROGER: &str = "g";
    pub const ACTION: &str = "a";
    pub const NAME: &str = "n";
    pub const INDEX: &str = "x";
    pub const DESCRIPTION: &str = "d";
    /// Source tag (remote, local, here). Consumed before a message hits the wire.
    pub const SOURCE: &str = "b";
}

/// `to` value addressing every talker.
pub const BROADCAST: &str = "*";

/// Key of the `n`-th extra payload field ("0", "1", ...).
pub fn extra_key(n: usize) -> String {
    n.to_string()
}

/// Integer on the wire that does not map to any code of the expected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} code {value} out of range")]
pub struct CodeError {
    pub kind: &'static str,
    pub value: u64,
}

macro_rules! talkie_code {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_u64(self) -> u64 {
                self as u64
            }

            /// Lower-case name, as typed by users.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|c| c.name() == name)
            }
        }

        impl TryFrom<u64> for $name {
            type Error = CodeError;

            fn try_from(value: u64) -> Result<Self, CodeError> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|c| c.as_u64() == value)
                    .ok_or(CodeError { kind: stringify!($name), value })
            }
        }

        impl From<$name> for u64 {
            fn from(code: $name) -> u64 {
                code.as_u64()
            }
        }

        impl From<$name> for Value {
            fn from(code: $name) -> Value {
                Value::Integer(code.as_u64())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

talkie_code! {
    /// Message code (`m`). Codes below [`MessageCode::Echo`] are requests.
    MessageCode {
        Run = 0 => "run",
        Set = 1 => "set",
        Get = 2 => "get",
        List = 3 => "list",
        Sys = 4 => "sys",
        Talk = 5 => "talk",
        Channel = 6 => "channel",
        Ping = 7 => "ping",
        Echo = 8 => "echo",
        Error = 9 => "error",
        Noise = 10 => "noise",
    }
}

impl MessageCode {
    /// True for original requests that expect an echo back.
    pub fn is_request(self) -> bool {
        self.as_u64() < MessageCode::Echo.as_u64()
    }
}

talkie_code! {
    /// Acknowledgment outcome (`g`).
    RogerCode {
        Roger = 0 => "roger",
        SayAgain = 1 => "say_again",
        Negative = 2 => "negative",
        Nil = 3 => "nil",
    }
}

talkie_code! {
    /// Error kind (`e`) carried by ERROR messages.
    ErrorCode {
        From = 0 => "from",
        Field = 1 => "field",
        Checksum = 2 => "checksum",
        Message = 3 => "message",
        Identity = 4 => "identity",
        Delay = 5 => "delay",
        Key = 6 => "key",
        Data = 7 => "data",
    }
}

talkie_code! {
    /// SYS sub-operation (`s`).
    SystemCode {
        Board = 0 => "board",
        Drops = 1 => "drops",
        Delay = 2 => "delay",
        Mute = 3 => "mute",
        Unmute = 4 => "unmute",
        Muted = 5 => "muted",
        Socket = 6 => "socket",
        Talker = 7 => "talker",
        Manifesto = 8 => "manifesto",
    }
}

talkie_code! {
    /// Where an outgoing message goes (`b`): over the wire with a checksum,
    /// over the wire without one, or straight back into local dispatch.
    Source {
        Remote = 0 => "remote",
        Local = 1 => "local",
        Here = 2 => "here",
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_below_echo() {
        let requests: Vec<_> = MessageCode::ALL
            .iter()
            .copied()
            .filter(|c| c.is_request())
            .collect();
        assert_eq!(requests.len(), 8);
        assert!(!MessageCode::Echo.is_request());
        assert!(!MessageCode::Error.is_request());
        assert!(!MessageCode::Noise.is_request());
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert_eq!(MessageCode::try_from(7), Ok(MessageCode::Ping));
        let err = MessageCode::try_from(11).unwrap_err();
        assert_eq!(err.value, 11);
        assert!(SystemCode::try_from(9).is_err());
    }

    #[test]
    fn names_round_trip() {
        for code in SystemCode::ALL {
            assert_eq!(SystemCode::from_name(code.name()), Some(*code));
        }
        assert_eq!(RogerCode::SayAgain.to_string(), "say_again");
        assert_eq!(MessageCode::from_name("buzz"), None);
    }
}
