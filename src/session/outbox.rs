use crate::network::messages::DataMessage;
use std::collections::HashMap;

/// Remembers the last payload sent per (recipient, descriptor) so that an
/// unchanged message is not sent twice.
#[derive(Debug, Default)]
pub struct Outbox {
    last_sent: HashMap<(String, &'static str), Vec<u8>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message` should go to `email`. A `true` answer records it as
    /// sent. `force` sends even an identical payload.
    pub fn should_send(&mut self, email: &str, message: &DataMessage, force: bool) -> bool {
        let payload = match bincode::serialize(message) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Outbox: could not encode {}: {e}", message.descriptor());
                return true;
            }
        };
        let key = (email.to_ascii_lowercase(), message.descriptor());
        if !force && self.last_sent.get(&key) == Some(&payload) {
            return false;
        }
        self.last_sent.insert(key, payload);
        true
    }

    /// Next message to `email` goes out whatever it holds.
    pub fn forget(&mut self, email: &str) {
        let email = email.to_ascii_lowercase();
        self.last_sent.retain(|(who, _), _| *who != email);
    }

    pub fn clear(&mut self) {
        self.last_sent.clear();
    }
}
