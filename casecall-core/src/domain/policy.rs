use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::FlowPolicyId;

/// Contact channels a flow policy can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Call,
    Sms,
    Email,
}

impl Channel {
    pub fn key(self) -> &'static str {
        match self {
            Channel::Call => "call",
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }
}

/// Per account-group contact configuration. Read-only to this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactPolicy {
    pub id: FlowPolicyId,
    /// Channel flags as stored (`{"call": true, "sms": false}`).
    pub channels: BTreeMap<String, bool>,
}

impl ContactPolicy {
    /// Decodes the stored `channels` JSON using the same truthiness as the
    /// selection query's `(channels->>'call')::boolean` cast.
    pub fn from_channels_json(id: FlowPolicyId, channels: serde_json::Value) -> Self {
        let channels = match channels {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, flag_enabled(&v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Self { id, channels }
    }

    pub fn allows(&self, channel: Channel) -> bool {
        self.channels.get(channel.key()).copied().unwrap_or(false)
    }

    pub fn with_channel(mut self, channel: Channel, enabled: bool) -> Self {
        self.channels.insert(channel.key().to_string(), enabled);
        self
    }
}

fn flag_enabled(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "t" | "true" | "y" | "yes" | "on" | "1"
        ),
        _ => false,
    }
}
