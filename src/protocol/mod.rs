//! Protocol definitions and constants
//!
//! A client opens a connection and sends one framing line:
//!
//! ```text
//! <base64 ciphertext of "host:port">\n
//! ```
//!
//! From then on the connection carries raw backend bytes. If the tunnel
//! cannot be set up, the server writes exactly one [`Signal`] byte and
//! closes.

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Framing line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed before framing line")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown signal byte: {0:#04x}")]
    UnknownSignal(u8),
}

/// Framing line terminator
pub const LINE_DELIMITER: u8 = b'\n';

/// Single-byte failure codes written to the client before closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Signal {
    /// Backend dial timed out
    DialTimeout = 0x01,
    /// Backend dial failed for any other reason
    DialError = 0x02,
    /// Framing line unreadable or larger than the read buffer
    ReadFrameError = 0x04,
    /// Ciphertext did not decrypt under the shared secret
    DecryptError = 0x06,
}

impl Signal {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::DialTimeout => "dial_timeout",
            Signal::DialError => "dial_error",
            Signal::ReadFrameError => "read_frame_error",
            Signal::DecryptError => "decrypt_error",
        }
    }
}

impl TryFrom<u8> for Signal {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Signal::DialTimeout),
            0x02 => Ok(Signal::DialError),
            0x04 => Ok(Signal::ReadFrameError),
            0x06 => Ok(Signal::DecryptError),
            _ => Err(ProtocolError::UnknownSignal(value)),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_byte())
    }
}

/// Build the framing line for a ciphertext
pub fn encode_request(ciphertext: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(ciphertext.len() + 1);
    line.extend_from_slice(ciphertext);
    line.push(LINE_DELIMITER);
    line
}

/// Strip the line terminator (`\n` or `\r\n`)
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(&[LINE_DELIMITER]).unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_bytes() {
        assert_eq!(Signal::DialTimeout.as_byte(), 0x01);
        assert_eq!(Signal::DialError.as_byte(), 0x02);
        assert_eq!(Signal::ReadFrameError.as_byte(), 0x04);
        assert_eq!(Signal::DecryptError.as_byte(), 0x06);
    }

    #[test]
    fn test_signal_parse() {
        for signal in [
            Signal::DialTimeout,
            Signal::DialError,
            Signal::ReadFrameError,
            Signal::DecryptError,
        ] {
            assert_eq!(Signal::try_from(signal.as_byte()).unwrap(), signal);
        }
        assert!(matches!(
            Signal::try_from(0x03),
            Err(ProtocolError::UnknownSignal(0x03))
        ));
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(encode_request(b"abc"), b"abc\n");
    }

    #[test]
    fn test_trim_line() {
        assert_eq!(trim_line(b"abc\n"), b"abc");
        assert_eq!(trim_line(b"abc\r\n"), b"abc");
        assert_eq!(trim_line(b"abc"), b"abc");
        assert_eq!(trim_line(b"\n"), b"");
    }
}
