//! Group wire messages: newline-delimited JSON records with a type
//! discriminator. One enum covers both directions; hosts and clients simply
//! never send some variants.

use serde::{Deserialize, Serialize};

/// Error code for a group at member capacity.
pub const ERR_FULL: &str = "full";
/// Error code for an unknown group id.
pub const ERR_NOT_FOUND: &str = "not_found";
/// Error code for a malformed or out-of-order record.
pub const ERR_PROTOCOL: &str = "protocol";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupMsg {
    /// Client → host, must be the first record on a stream.
    Join { group: String },

    /// Host → client, reply to a successful join.
    Welcome {
        group: String,
        group_name: String,
        app_type: String,
        max_members: u32,
        volatile: bool,
        members: Vec<String>,
    },

    /// Host → clients, membership update broadcast.
    Members { group: String, members: Vec<String> },

    /// Host → clients, group metadata change.
    Meta {
        group: String,
        group_name: String,
        app_type: String,
        max_members: u32,
    },

    /// Application payload, relayed by the host to every other member.
    Msg {
        group: String,
        from: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Application state payload; same relay path as `Msg`.
    State {
        group: String,
        from: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Client → host, clean departure.
    Leave { group: String },

    /// Host → clients, the group is gone.
    Close { group: String },

    Ping {},
    Pong {},

    Error { code: String, message: String },
}

impl GroupMsg {
    /// Serialise to one wire line (with trailing newline).
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn discriminator_is_snake_case_type_field() {
        let msg = GroupMsg::Welcome {
            group: "g1".to_string(),
            group_name: "my group".to_string(),
            app_type: "chat".to_string(),
            max_members: 0,
            volatile: false,
            members: vec!["peer-a".to_string()],
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["max_members"], 0);
        assert_eq!(value["members"][0], "peer-a");
    }

    #[test]
    fn roundtrip_every_variant() {
        let variants = vec![
            GroupMsg::Join { group: "g".into() },
            GroupMsg::Members { group: "g".into(), members: vec![] },
            GroupMsg::Meta {
                group: "g".into(),
                group_name: "n".into(),
                app_type: "chat".into(),
                max_members: 4,
            },
            GroupMsg::Msg {
                group: "g".into(),
                from: "p".into(),
                payload: json!({"k": 1}),
            },
            GroupMsg::State {
                group: "g".into(),
                from: "p".into(),
                payload: json!([1, 2]),
            },
            GroupMsg::Leave { group: "g".into() },
            GroupMsg::Close { group: "g".into() },
            GroupMsg::Ping {},
            GroupMsg::Pong {},
            GroupMsg::Error {
                code: ERR_FULL.into(),
                message: "group is full".into(),
            },
        ];
        for msg in variants {
            let line = msg.to_line().unwrap();
            let back: GroupMsg = serde_json::from_slice(&line).unwrap();
            // re-serialising must be stable
            assert_eq!(back.to_line().unwrap(), line);
        }
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let back: GroupMsg =
            serde_json::from_str(r#"{"type":"msg","group":"g","from":"p"}"#).unwrap();
        match back {
            GroupMsg::Msg { payload, .. } => assert!(payload.is_null()),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
