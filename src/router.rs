//! Decides which host answers an inbound chat event.
//!
//! Every host polls the same chat, so every host sees every event.  Events
//! are parsed once into [`Command`] or [`Callback`] and routed against a
//! registry snapshot:
//!
//! * global commands are answered everywhere,
//! * callbacks naming a host are answered only by that host,
//! * everything else is answered by the coordinator.

use std::fmt;

use crate::registry::RegistrySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Servers,
    Update,
    Restart,
    Monitor,
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let word = text.split_whitespace().next().unwrap_or_default();
        // `/status@SomeBot` is how group chats address a bot.
        let word = word.split('@').next().unwrap_or_default();
        match word {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/status" => Command::Status,
            "/servers" => Command::Servers,
            "/update" => Command::Update,
            "/restart" => Command::Restart,
            "/monitor" => Command::Monitor,
            other => Command::Unknown(other.to_string()),
        }
    }

    fn is_global(&self) -> bool {
        matches!(self, Command::Start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOp {
    Add,
    Remove,
    List,
}

impl MonitorOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(MonitorOp::Add),
            "remove" => Some(MonitorOp::Remove),
            "list" => Some(MonitorOp::List),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MonitorOp::Add => "add",
            MonitorOp::Remove => "remove",
            MonitorOp::List => "list",
        }
    }
}

/// An inline-button payload.  Addressed variants carry the target host as
/// the second colon-delimited field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    StatusHost { host: String },
    UpdateHost { host: String },
    RestartHost { host: String },
    PickUpdate { host: String, container: String },
    ConfirmUpdate { host: String, container: String },
    PickRestart { host: String, container: String },
    ConfirmRestart { host: String, container: String },
    MonitorHost { host: String, op: MonitorOp },
    AddMonitor { host: String, container: String },
    RemoveMonitor { host: String, container: String },
    MonitorMenu(MonitorOp),
    Cancel,
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, ':');
        let action = parts.next()?;
        let first = parts.next().filter(|s| !s.is_empty());
        let second = parts.next().filter(|s| !s.is_empty());

        let host = || first.map(str::to_string);
        let pair = || Some((first?.to_string(), second?.to_string()));

        let cb = match action {
            "status_srv" => Callback::StatusHost { host: host()? },
            "update_srv" => Callback::UpdateHost { host: host()? },
            "restart_srv" => Callback::RestartHost { host: host()? },
            "update_cnt" => {
                let (host, container) = pair()?;
                Callback::PickUpdate { host, container }
            }
            "confirm_update" => {
                let (host, container) = pair()?;
                Callback::ConfirmUpdate { host, container }
            }
            "restart_cnt" => {
                let (host, container) = pair()?;
                Callback::PickRestart { host, container }
            }
            "confirm_restart" => {
                let (host, container) = pair()?;
                Callback::ConfirmRestart { host, container }
            }
            "monitor_srv" => {
                let (host, op) = pair()?;
                let op = MonitorOp::parse(&op).filter(|op| *op != MonitorOp::List)?;
                Callback::MonitorHost { host, op }
            }
            "add_mon" => {
                let (host, container) = pair()?;
                Callback::AddMonitor { host, container }
            }
            "rem_mon" => {
                let (host, container) = pair()?;
                Callback::RemoveMonitor { host, container }
            }
            "monitor_action" => Callback::MonitorMenu(MonitorOp::parse(first?)?),
            "cancel" => Callback::Cancel,
            _ => return None,
        };
        Some(cb)
    }

    /// The host this callback is addressed to, if any.
    pub fn target_host(&self) -> Option<&str> {
        match self {
            Callback::StatusHost { host }
            | Callback::UpdateHost { host }
            | Callback::RestartHost { host }
            | Callback::PickUpdate { host, .. }
            | Callback::ConfirmUpdate { host, .. }
            | Callback::PickRestart { host, .. }
            | Callback::ConfirmRestart { host, .. }
            | Callback::MonitorHost { host, .. }
            | Callback::AddMonitor { host, .. }
            | Callback::RemoveMonitor { host, .. } => Some(host),
            Callback::MonitorMenu(_) | Callback::Cancel => None,
        }
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::StatusHost { host } => write!(f, "status_srv:{}", host),
            Callback::UpdateHost { host } => write!(f, "update_srv:{}", host),
            Callback::RestartHost { host } => write!(f, "restart_srv:{}", host),
            Callback::PickUpdate { host, container } => write!(f, "update_cnt:{}:{}", host, container),
            Callback::ConfirmUpdate { host, container } => {
                write!(f, "confirm_update:{}:{}", host, container)
            }
            Callback::PickRestart { host, container } => {
                write!(f, "restart_cnt:{}:{}", host, container)
            }
            Callback::ConfirmRestart { host, container } => {
                write!(f, "confirm_restart:{}:{}", host, container)
            }
            Callback::MonitorHost { host, op } => write!(f, "monitor_srv:{}:{}", host, op.as_str()),
            Callback::AddMonitor { host, container } => write!(f, "add_mon:{}:{}", host, container),
            Callback::RemoveMonitor { host, container } => {
                write!(f, "rem_mon:{}:{}", host, container)
            }
            Callback::MonitorMenu(op) => write!(f, "monitor_action:{}", op.as_str()),
            Callback::Cancel => write!(f, "cancel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Handle,
    Ignore,
}

impl Decision {
    fn from_bool(handle: bool) -> Self {
        if handle {
            Decision::Handle
        } else {
            Decision::Ignore
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    local_host: String,
    primary_host: String,
}

impl Router {
    pub fn new(local_host: impl Into<String>, primary_host: impl Into<String>) -> Self {
        Self {
            local_host: local_host.into(),
            primary_host: primary_host.into(),
        }
    }

    fn is_coordinator(&self, snapshot: &RegistrySnapshot) -> bool {
        snapshot.coordinator(&self.primary_host, &self.local_host) == self.local_host
    }

    pub fn route_command(&self, command: &Command, snapshot: &RegistrySnapshot) -> Decision {
        if command.is_global() {
            return Decision::Handle;
        }
        Decision::from_bool(self.is_coordinator(snapshot))
    }

    /// `callback` is `None` when the payload did not parse; the coordinator
    /// answers those so the button does not spin forever.
    pub fn route_callback(
        &self,
        callback: Option<&Callback>,
        snapshot: &RegistrySnapshot,
    ) -> Decision {
        match callback.and_then(Callback::target_host) {
            Some(host) => Decision::from_bool(host == self.local_host),
            None => Decision::from_bool(self.is_coordinator(snapshot)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostRecord;
    use std::time::Duration;

    fn snapshot(live: &[&str]) -> RegistrySnapshot {
        let records = live
            .iter()
            .map(|h| {
                (
                    h.to_string(),
                    HostRecord {
                        last_heartbeat: 100.0,
                        ..Default::default()
                    },
                )
            })
            .collect();
        RegistrySnapshot::new(records, 100.0, Duration::from_secs(90))
    }

    fn routers(primary: &str) -> Vec<(&'static str, Router)> {
        ["hostA", "hostB", "hostC"]
            .into_iter()
            .map(|h| (h, Router::new(h, primary)))
            .collect()
    }

    #[test]
    fn payloads_parse_into_typed_callbacks() {
        assert_eq!(
            Callback::parse("confirm_update:hostB:web"),
            Some(Callback::ConfirmUpdate {
                host: "hostB".into(),
                container: "web".into()
            })
        );
        assert_eq!(
            Callback::parse("monitor_srv:hostA:remove"),
            Some(Callback::MonitorHost {
                host: "hostA".into(),
                op: MonitorOp::Remove
            })
        );
        assert_eq!(Callback::parse("cancel"), Some(Callback::Cancel));
        assert_eq!(Callback::parse("update_cnt:hostA"), None);
        assert_eq!(Callback::parse("bogus:hostA"), None);
        assert_eq!(Callback::parse("monitor_action:explode"), None);
    }

    #[test]
    fn container_names_may_contain_colons() {
        let cb = Callback::parse("rem_mon:hostA:odd:name").unwrap();
        assert_eq!(
            cb,
            Callback::RemoveMonitor {
                host: "hostA".into(),
                container: "odd:name".into()
            }
        );
    }

    #[test]
    fn display_produces_parseable_payloads() {
        for cb in [
            Callback::RestartHost { host: "h".into() },
            Callback::MonitorHost {
                host: "h".into(),
                op: MonitorOp::Add,
            },
            Callback::MonitorMenu(MonitorOp::List),
        ] {
            assert_eq!(Callback::parse(&cb.to_string()), Some(cb));
        }
    }

    #[test]
    fn commands_strip_bot_suffix_and_arguments() {
        assert_eq!(Command::parse("/status@fleet_bot"), Command::Status);
        assert_eq!(Command::parse("/update now"), Command::Update);
        assert_eq!(Command::parse("hello"), Command::Unknown("hello".into()));
    }

    #[test]
    fn addressed_callback_goes_only_to_its_host() {
        let snap = snapshot(&["hostA", "hostB", "hostC"]);
        let cb = Callback::parse("status_srv:hostB");
        for primary in ["hostA", "hostB", "hostC", ""] {
            for (host, router) in routers(primary) {
                let expected = if host == "hostB" {
                    Decision::Handle
                } else {
                    Decision::Ignore
                };
                assert_eq!(router.route_callback(cb.as_ref(), &snap), expected);
            }
        }
    }

    #[test]
    fn address_free_command_goes_only_to_the_coordinator() {
        let cmd = Command::parse("/status");
        let cases = [
            (snapshot(&["hostA", "hostB", "hostC"]), "hostC", "hostC"),
            (snapshot(&["hostA", "hostB"]), "hostC", "hostA"),
            (snapshot(&["hostC", "hostB"]), "", "hostB"),
        ];
        for (snap, primary, coordinator) in cases {
            for (host, router) in routers(primary) {
                let handled = router.route_command(&cmd, &snap) == Decision::Handle;
                assert_eq!(handled, host == coordinator, "{} / {}", host, primary);
            }
        }
    }

    #[test]
    fn every_host_answers_with_an_empty_registry() {
        let snap = snapshot(&[]);
        for (_, router) in routers("hostA") {
            assert_eq!(
                router.route_command(&Command::Help, &snap),
                Decision::Handle
            );
        }
    }

    #[test]
    fn global_commands_are_handled_everywhere() {
        let snap = snapshot(&["hostA"]);
        for (_, router) in routers("hostA") {
            assert_eq!(router.route_command(&Command::Start, &snap), Decision::Handle);
        }
    }

    #[test]
    fn unparsed_and_unaddressed_callbacks_go_to_the_coordinator() {
        let snap = snapshot(&["hostA", "hostB"]);
        for (host, router) in routers("hostB") {
            let expected = Decision::from_bool(host == "hostB");
            assert_eq!(router.route_callback(None, &snap), expected);
            assert_eq!(
                router.route_callback(Some(&Callback::Cancel), &snap),
                expected
            );
        }
    }
}
