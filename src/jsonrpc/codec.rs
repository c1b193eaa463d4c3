use super::error::Result;
use super::message::{InboundMessage, OutgoingCall};

/// Converts between wire lines and messages.
///
/// The reader loop splits the inbound stream on `\n` and hands each line
/// (terminator stripped, bytes not yet checked as UTF-8) to `decode`;
/// `encode` must produce a complete line including its terminator.
pub trait WireCodec: Send + Sync + 'static {
    fn encode(&self, call: &OutgoingCall) -> Result<Vec<u8>>;

    fn decode(&self, line: &[u8]) -> Result<InboundMessage>;
}

/// One JSON value per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineCodec;

impl WireCodec for JsonLineCodec {
    fn encode(&self, call: &OutgoingCall) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(call)?;
        line.push(b'\n');
        Ok(line)
    }

    fn decode(&self, line: &[u8]) -> Result<InboundMessage> {
        Ok(serde_json::from_slice(line)?)
    }
}
