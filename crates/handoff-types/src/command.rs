use serde::{Deserialize, Serialize};

/// Version stamped into every command. Peers with a different version are
/// tolerated but logged.
pub const PROTOCOL_VERSION: u32 = 1;

/// Control message exchanged over the command channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub version: u32,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// First frame from the receiver; proves account and session.
    Connect { code: u16, user_id: String },
    /// Number of logical units the sender is about to stream.
    Start { total: u64 },
    /// Receiver progress as a percentage in `[0, 100]`.
    Progress { progress: f64 },
    Finish,
    Push(PushContext),
    Pull,
    Cancel,
}

/// Connection parameters announced by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushContext {
    pub hostname: String,
    pub port: u16,
    pub code: u16,
    /// Base64 session key pair (cipher key first).
    pub key: String,
    pub user_id: String,
}

impl Command {
    pub fn new(action: Action) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            action,
        }
    }

    pub fn connect(code: u16, user_id: impl Into<String>) -> Self {
        Self::new(Action::Connect {
            code,
            user_id: user_id.into(),
        })
    }

    pub fn start(total: u64) -> Self {
        Self::new(Action::Start { total })
    }

    pub fn progress(progress: f64) -> Self {
        Self::new(Action::Progress { progress })
    }

    pub fn finish() -> Self {
        Self::new(Action::Finish)
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self.action {
            Action::Connect { .. } => "connect",
            Action::Start { .. } => "start",
            Action::Progress { .. } => "progress",
            Action::Finish => "finish",
            Action::Push(_) => "push",
            Action::Pull => "pull",
            Action::Cancel => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_wire_shape() {
        let json = serde_json::to_value(Command::connect(42, "U1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"version": 1, "action": "connect", "code": 42, "user_id": "U1"})
        );
    }

    #[test]
    fn unit_actions_carry_only_the_tag() {
        let json = serde_json::to_value(Command::finish()).unwrap();
        assert_eq!(json, serde_json::json!({"version": 1, "action": "finish"}));
    }

    #[test]
    fn push_flattens_context() {
        let cmd = Command::new(Action::Push(PushContext {
            hostname: "192.168.1.2".into(),
            port: 5000,
            code: 7,
            key: "a2V5".into(),
            user_id: "U1".into(),
        }));
        let bytes = serde_json::to_vec(&cmd).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["action"], "push");
        assert_eq!(value["port"], 5000);
        assert_eq!(serde_json::from_slice::<Command>(&bytes).unwrap(), cmd);
    }

    #[test]
    fn missing_version_defaults_to_zero() {
        let cmd: Command = serde_json::from_str(r#"{"action":"start","total":3}"#).unwrap();
        assert_eq!(cmd.version, 0);
        assert_eq!(cmd.action, Action::Start { total: 3 });
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"version":1,"action":"reboot"}"#).is_err());
    }
}
