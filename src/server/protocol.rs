//! Wire-protocol detection.

/// What a connection speaks, judged from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `<`: raw XML device protocol
    Xml,
    /// `{`: raw JSON device protocol
    Json,
    /// `G` or `P`: a GET or PUT request
    Http,
    /// Anything else; the connection is dropped
    Unknown,
}

impl Protocol {
    /// Classify a connection by the first byte the client sent.
    pub fn classify(first_byte: u8) -> Self {
        match first_byte {
            b'<' => Protocol::Xml,
            b'{' => Protocol::Json,
            b'G' | b'P' => Protocol::Http,
            _ => Protocol::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Protocol;

    #[test]
    fn test_classify() {
        assert_eq!(Protocol::classify(b'<'), Protocol::Xml);
        assert_eq!(Protocol::classify(b'{'), Protocol::Json);
        assert_eq!(Protocol::classify(b'G'), Protocol::Http);
        assert_eq!(Protocol::classify(b'P'), Protocol::Http);
        assert_eq!(Protocol::classify(b'g'), Protocol::Unknown);
        assert_eq!(Protocol::classify(0x16), Protocol::Unknown);
    }
}
