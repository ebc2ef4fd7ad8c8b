use crate::error::Error;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    pub permessage_deflate: bool,
    pub client_no_context_takeover: Option<bool>,
    pub server_no_context_takeover: Option<bool>,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Parses a `Sec-WebSocket-Extensions` header value. Only the single
/// permessage-deflate slot is understood; anything else yields `None`, which
/// the caller treats as "no extension".
pub fn parse_extensions(extensions_header_value: String) -> Option<Extensions> {
    // Each `;`-separated directive is a bare flag or a `key=value` pair;
    // normalize to (key, value) before dispatching
    let directives = extensions_header_value
        .split(';')
        .map(|directive| match directive.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (directive.trim(), None),
        });

    let mut extensions = Extensions::default();
    for (key, value) in directives {
        match key {
            PERMESSAGE_DEFLATE => extensions.permessage_deflate = true,
            CLIENT_NO_CONTEXT_TAKEOVER => extensions.client_no_context_takeover = Some(true),
            SERVER_NO_CONTEXT_TAKEOVER => extensions.server_no_context_takeover = Some(true),
            CLIENT_MAX_WINDOW_BITS => extensions.client_max_window_bits = window_bits(value),
            SERVER_MAX_WINDOW_BITS => extensions.server_max_window_bits = window_bits(value),
            _ => {}
        }
    }

    extensions.permessage_deflate.then_some(extensions)
}

// A bare window-bits flag means the full 32 KiB window; an explicit value
// must be a number or the parameter is ignored
fn window_bits(value: Option<&str>) -> Option<u8> {
    match value {
        None => Some(15),
        Some(raw) => raw.parse().ok(),
    }
}

impl Extensions {
    /// The offer a client puts in its upgrade request.
    pub fn offer() -> Self {
        Extensions {
            permessage_deflate: true,
            ..Default::default()
        }
    }

    /// Validates the window-bit parameters, which have to fit a deflate
    /// window of 2^8 to 2^15.
    pub fn validate(&self) -> Result<(), Error> {
        for bits in [self.client_max_window_bits, self.server_max_window_bits]
            .into_iter()
            .flatten()
        {
            if !(8..=15).contains(&bits) {
                return Err(Error::InvalidMaxWindowBits);
            }
        }
        Ok(())
    }

    /// Renders the header value announcing this set, used both for the
    /// client offer and the server's agreement.
    pub fn header_value(&self) -> String {
        let mut value = String::from(PERMESSAGE_DEFLATE);
        if self.client_no_context_takeover == Some(true) {
            value.push_str("; ");
            value.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
        }
        if self.server_no_context_takeover == Some(true) {
            value.push_str("; ");
            value.push_str(SERVER_NO_CONTEXT_TAKEOVER);
        }
        if let Some(bits) = self.client_max_window_bits {
            value.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
        }
        if let Some(bits) = self.server_max_window_bits {
            value.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
        }
        value
    }

    /// Server-side decision against a client offer: deflate is agreed only
    /// when the server enables it, and the takeover flags the client asked
    /// for are echoed back.
    pub fn negotiate(offer: Option<Extensions>, enable_deflate: bool) -> Option<Extensions> {
        let offer = offer?;
        if !enable_deflate || !offer.permessage_deflate {
            return None;
        }
        Some(offer)
    }
}

/// Appends the extension header to a client upgrade request under
/// construction.
pub fn add_extension_headers(request: &mut String, extensions: Option<Extensions>) {
    if let Some(extensions) = extensions {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            extensions.header_value()
        ));
    }
}
