//! Minimal TELNET server side.
//!
//! Only ECHO, SUPPRESS-GO-AHEAD and BINARY are negotiated. Every other
//! option the viewer asks us to enable is refused with WONT; offers from
//! the viewer are ignored.

use std::borrow::Cow;

/// Interpret as command.
pub const IAC: u8 = 255;
/// Ask the peer to stop performing an option.
pub const DONT: u8 = 254;
/// Ask the peer to perform an option.
pub const DO: u8 = 253;
/// Refuse to perform an option.
pub const WONT: u8 = 252;
/// Offer to perform an option.
pub const WILL: u8 = 251;
/// Subnegotiation begin.
pub const SB: u8 = 250;
/// Are you there.
pub const AYT: u8 = 246;
/// Subnegotiation end.
pub const SE: u8 = 240;

/// Binary transmission option.
pub const BINARY: u8 = 0;
/// Echo option.
pub const ECHO: u8 = 1;
/// Suppress go-ahead option.
pub const SGA: u8 = 3;

/// Reply to an AYT command.
pub const AYT_REPLY: &[u8] = b"\r\n[netsim-compute: yes]\r\n";

/// Negotiation sent to every new viewer.
pub const ANNOUNCE: [u8; 12] = [
    IAC, WILL, ECHO, IAC, WILL, SGA, IAC, WILL, BINARY, IAC, DO, BINARY,
];

fn is_supported(option: u8) -> bool {
    matches!(option, BINARY | ECHO | SGA)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Data,
    /// After CR.
    Return,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Result of filtering viewer input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    /// Bytes for the backend.
    pub data: Vec<u8>,
    /// Bytes to send back to the viewer.
    pub reply: Vec<u8>,
}

/// Strips TELNET commands from one viewer's input stream.
///
/// State survives across reads so sequences split between packets are
/// handled.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    /// New filter in data state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk of viewer input.
    pub fn feed(&mut self, input: &[u8]) -> Filtered {
        let mut out = Filtered::default();
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data | State::Return, IAC) => State::Iac,
                // CR NUL is a bare carriage return.
                (State::Return, 0) => State::Data,
                (State::Data | State::Return, b'\r') => {
                    out.data.push(byte);
                    State::Return
                }
                (State::Data | State::Return, _) => {
                    out.data.push(byte);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.data.push(IAC);
                    State::Data
                }
                (State::Iac, WILL | WONT | DO | DONT) => State::Option(byte),
                (State::Iac, SB) => State::Sub,
                (State::Iac, AYT) => {
                    out.reply.extend_from_slice(AYT_REPLY);
                    State::Data
                }
                (State::Iac, _) => State::Data,
                (State::Option(command), option) => {
                    if command == DO && !is_supported(option) {
                        out.reply.extend_from_slice(&[IAC, WONT, option]);
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
        out
    }
}

/// Double literal 0xFF bytes for a telnet viewer.
pub fn escape_iac(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + 8);
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_data_passes() {
        let mut filter = TelnetFilter::new();
        assert_eq!(filter.feed(b"show ip\n").data, b"show ip\n");
    }

    #[test]
    fn test_negotiation_is_stripped() {
        let mut filter = TelnetFilter::new();
        let out = filter.feed(&[IAC, DO, ECHO, b'a', IAC, WILL, SGA, b'b', IAC, DONT, BINARY]);
        assert_eq!(out.data, b"ab");
        assert!(out.reply.is_empty());
    }

    #[test]
    fn test_unsupported_option_refused() {
        let mut filter = TelnetFilter::new();
        // NAWS (31) requested, terminal type (24) offered.
        let out = filter.feed(&[IAC, DO, 31, IAC, WILL, 24]);
        assert!(out.data.is_empty());
        assert_eq!(out.reply, [IAC, WONT, 31]);
    }

    #[test]
    fn test_split_sequences_and_literal_iac() {
        let mut filter = TelnetFilter::new();
        assert_eq!(filter.feed(&[b'x', IAC]).data, b"x");
        assert_eq!(filter.feed(&[IAC, b'y']).data, [IAC, b'y']);
        assert!(filter.feed(&[IAC]).data.is_empty());
        assert_eq!(filter.feed(&[DO]).data, b"");
        assert_eq!(filter.feed(&[ECHO, b'z']).data, b"z");
    }

    #[test]
    fn test_subnegotiation_skipped() {
        let mut filter = TelnetFilter::new();
        let out = filter.feed(&[b'a', IAC, SB, 31, 0, 80, IAC, IAC, 0, 24, IAC, SE, b'b']);
        assert_eq!(out.data, b"ab");
    }

    #[test]
    fn test_ayt_reply() {
        let mut filter = TelnetFilter::new();
        let out = filter.feed(&[IAC, AYT]);
        assert_eq!(out.reply, AYT_REPLY);
        assert!(out.data.is_empty());
    }

    #[test]
    fn test_cr_nul() {
        let mut filter = TelnetFilter::new();
        assert_eq!(filter.feed(b"ls\r\0").data, b"ls\r");
        assert_eq!(filter.feed(b"ls\r\n").data, b"ls\r\n");
    }

    #[test]
    fn test_escape_iac() {
        assert!(matches!(escape_iac(b"abc"), Cow::Borrowed(_)));
        assert_eq!(escape_iac(&[1, IAC, 2]).into_owned(), vec![1, IAC, IAC, 2]);
    }
}
