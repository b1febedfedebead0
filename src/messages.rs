//! HTML texts sent to the chat.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Local;

use crate::registry::{RegistrySnapshot, VERSION};
use crate::updater::UpdateOutcome;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

pub fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn code(text: &str) -> String {
    format!("<code>{}</code>", escape(text))
}

fn age(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=29 => "just now".to_string(),
        30..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

fn host_header(host: &str, container: &str) -> String {
    format!("🖥️ Host: {}\n📦 Container: {}", code(host), code(container))
}

pub fn startup(host: &str, is_primary: bool) -> String {
    let role = if is_primary { "primary 🌟" } else { "secondary" };
    format!(
        "<b>[{host}]</b> 🚀 <b>Started</b>\n\n{RULE}\n🖥️ Host: {}\n🎭 Role: {}\n🏷️ Version: {}\n⏰ {}\n{RULE}\n\n✅ Monitoring is active",
        code(host),
        code(role),
        code(&format!("v{}", VERSION)),
        code(&now()),
        host = escape(host),
    )
}

pub fn shutdown(host: &str) -> String {
    format!(
        "<b>[{host}]</b> 🛑 <b>Stopped</b>\n\n{RULE}\n🖥️ Host: {}\n⏰ {}\n{RULE}\n\n⚠️ Monitoring has stopped",
        code(host),
        code(&now()),
        host = escape(host),
    )
}

fn host_list(snapshot: &RegistrySnapshot) -> String {
    let hosts = snapshot.active_hosts();
    if hosts.is_empty() {
        return "   <i>no live hosts</i>".to_string();
    }
    hosts
        .iter()
        .map(|h| {
            let primary = snapshot.record(h).map(|r| r.is_primary).unwrap_or(false);
            format!("   • {}{}", code(h), if primary { " 🌟" } else { "" })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn help(snapshot: &RegistrySnapshot) -> String {
    format!(
        "📖 <b>Commands</b>\n\n{RULE}\n\
         /status - host status\n\
         /servers - fleet overview\n\
         /update - update a container image\n\
         /restart - restart a container\n\
         /monitor - manage monitored containers\n\
         /help - this message\n\
         {RULE}\n<b>🌐 Live hosts ({}):</b>\n{}\n{RULE}",
        snapshot.active_hosts().len(),
        host_list(snapshot),
    )
}

pub fn servers(snapshot: &RegistrySnapshot) -> String {
    let hosts = snapshot.active_hosts();
    if hosts.is_empty() {
        return "⚠️ No live hosts".to_string();
    }
    let mut msg = format!("🌐 <b>Live hosts ({})</b>\n\n", hosts.len());
    for host in &hosts {
        let (count, primary) = snapshot
            .record(host)
            .map(|r| (r.workload_count, r.is_primary))
            .unwrap_or_default();
        let seen = snapshot.heartbeat_age(host).map(age).unwrap_or_default();
        msg.push_str(&format!(
            "🖥️ <b>{}{}</b> ({} containers)\n   Last heartbeat: {}\n\n",
            escape(host),
            if primary { " 🌟" } else { "" },
            count,
            seen
        ));
    }
    let primary = snapshot.claimed_primary().unwrap_or_else(|| "not set".to_string());
    msg.push_str(&format!(
        "{RULE}\n💡 Primary: {}\n⏰ Updated: {}",
        code(&primary),
        code(&now())
    ));
    msg
}

/// One monitored container line of the status report.
pub struct StatusLine {
    pub name: String,
    pub running: bool,
    pub tag: String,
}

pub fn host_status(
    host: &str,
    total: usize,
    monitored: &[StatusLine],
    excluded: &BTreeSet<String>,
) -> String {
    let mut msg = format!(
        "📊 <b>Host status</b>\n\n{RULE}\n🖥️ <b>Host</b>\n  Name: {}\n  Time: {}\n  Version: {}\n\n\
         📦 <b>Containers</b>\n  Total: {}\n  Monitored: {}\n  Excluded: {}\n\n🔍 <b>Monitored</b>",
        code(host),
        code(&now()),
        code(&format!("v{}", VERSION)),
        code(&total.to_string()),
        code(&monitored.len().to_string()),
        code(&excluded.len().to_string()),
    );
    if monitored.is_empty() {
        msg.push_str("\n   <i>none</i>");
    }
    for line in monitored {
        let icon = if line.running { "✅" } else { "❌" };
        msg.push_str(&format!("\n   {} {} [{}]", icon, code(&line.name), escape(&line.tag)));
    }
    if !excluded.is_empty() {
        msg.push_str("\n\n🚫 <b>Excluded</b>");
        for name in excluded {
            msg.push_str(&format!("\n   • {}", code(name)));
        }
    }
    msg.push('\n');
    msg.push_str(RULE);
    msg
}

pub fn pick_host(action: &str) -> String {
    format!("🖥️ <b>Choose a host to {}:</b>", action)
}

pub fn pick_container(host: &str, action: &str) -> String {
    format!("🖥️ <b>Host {}</b>\n\nChoose a container to {}:", code(host), action)
}

pub fn nothing_to_pick(host: &str, what: &str) -> String {
    format!("⚠️ Host {} has no containers to {}", code(host), what)
}

pub fn no_hosts() -> String {
    "⚠️ No hosts available".to_string()
}

pub fn confirm_update(host: &str, container: &str) -> String {
    format!(
        "⚠️ <b>Confirm update</b>\n\n{RULE}\n{}\n\n<b>Steps:</b>\n\
         1. Pull the latest image\n2. Stop the current container\n\
         3. Remove the old container\n4. Start a new container\n\n\
         ⚠️ The service will be briefly unavailable.\n\nContinue?\n{RULE}",
        host_header(host, container)
    )
}

pub fn update_progress(container: &str, phase: &str) -> String {
    format!("⏳ Updating {}...\n\n{}", code(container), escape(phase))
}

pub fn update_result(host: &str, container: &str, outcome: &UpdateOutcome) -> String {
    if outcome.succeeded {
        format!(
            "✅ <b>Update succeeded</b>\n\n{RULE}\n{}\n\n🔄 <b>Version</b>\n  Old: {}\n  New: {}\n\n⏰ {}\n{RULE}\n\n{}",
            host_header(host, container),
            code(&outcome.old_version),
            code(&outcome.new_version),
            code(&now()),
            escape(&outcome.message)
        )
    } else {
        format!(
            "❌ <b>Update failed</b>\n\n{RULE}\n{}\n\n❌ <b>Error</b>\n  {}\n\n💡 Check the image name and the container logs, then update manually if needed.\n{RULE}",
            host_header(host, container),
            escape(&outcome.message)
        )
    }
}

pub fn confirm_restart(host: &str, container: &str) -> String {
    format!(
        "⚠️ <b>Confirm restart</b>\n\n{RULE}\n{}\n\nContinue?\n{RULE}",
        host_header(host, container)
    )
}

pub fn restarting(container: &str) -> String {
    format!("⏳ Restarting {}...", code(container))
}

pub fn restart_result(host: &str, container: &str, error: Option<&str>) -> String {
    match error {
        None => format!(
            "✅ <b>Restart succeeded</b>\n\n{RULE}\n{}\n⏰ {}\n{RULE}",
            host_header(host, container),
            code(&now())
        ),
        Some(e) => format!(
            "❌ <b>Restart failed</b>\n\n{RULE}\n{}\n\n{}\n{RULE}",
            host_header(host, container),
            escape(e)
        ),
    }
}

pub fn monitor_menu() -> String {
    "📡 <b>Monitoring</b>\n\nChoose an action:".to_string()
}

pub fn monitor_pick_host(adding: bool) -> String {
    let action = if adding { "Add to monitoring" } else { "Remove from monitoring" };
    format!("📡 <b>{}</b>\n\nChoose a host:", action)
}

pub fn monitor_pick_container(host: &str, adding: bool) -> String {
    let action = if adding { "add to" } else { "remove from" };
    format!(
        "📡 <b>Monitoring</b>\n\n🖥️ Host: {}\n\nChoose a container to {} monitoring:",
        code(host),
        action
    )
}

pub fn all_monitored(host: &str) -> String {
    format!("✅ Every container on {} is already monitored", code(host))
}

pub fn none_monitored(host: &str) -> String {
    format!("⚠️ Host {} has no monitored containers", code(host))
}

pub fn monitor_changed(host: &str, container: &str, added: bool, saved: bool) -> String {
    if !saved {
        return format!(
            "❌ <b>Could not save the change</b>\n\n{RULE}\n{}\n{RULE}",
            host_header(host, container)
        );
    }
    let what = if added {
        "added to the monitoring list"
    } else {
        "removed from the monitoring list"
    };
    format!(
        "✅ <b>Saved</b>\n\n{RULE}\n{}\n\nContainer {}\n{RULE}",
        host_header(host, container),
        what
    )
}

pub fn cancelled() -> String {
    "❌ Cancelled".to_string()
}

pub fn container_updated(
    host: &str,
    container: &str,
    image: &str,
    old_version: &str,
    new_version: &str,
    running: bool,
) -> String {
    if running {
        format!(
            "<b>[{}]</b> ✨ <b>Container updated</b>\n\n{RULE}\n📦 <b>Container</b>\n  {}\n\n🎯 <b>Image</b>\n  {}\n\n\
             🔄 <b>Version</b>\n  {}\n  ➜\n  {}\n\n⏰ {}\n{RULE}\n\n✅ The container is running",
            escape(host),
            code(container),
            code(image),
            code(old_version),
            code(new_version),
            code(&now())
        )
    } else {
        format!(
            "<b>[{}]</b> ❌ <b>Container failed to start</b>\n\n{RULE}\n📦 <b>Container</b>\n  {}\n\n🎯 <b>Image</b>\n  {}\n\n\
             🔄 <b>Version</b>\n  Old: {}\n  New: {}\n\n⏰ {}\n{RULE}\n\n⚠️ Not running after the update\n💡 Check: {}",
            escape(host),
            code(container),
            code(image),
            code(old_version),
            code(new_version),
            code(&now()),
            code(&format!("docker logs {}", container))
        )
    }
}

pub fn watcher_error(host: &str, container: &str, line: &str) -> String {
    format!(
        "<b>[{}]</b> ⚠️ <b>Auto-update error</b>\n\n{RULE}\n📦 <b>Container</b>: {}\n🔴 <b>Error</b>: {}\n🕐 {}\n{RULE}",
        escape(host),
        code(container),
        code(&truncate(line, 200)),
        code(&now())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn markup_in_values_is_escaped() {
        assert_eq!(code("<b>&"), "<code>&lt;b&gt;&amp;</code>");
    }

    #[test]
    fn heartbeat_ages_read_naturally() {
        assert_eq!(age(Duration::from_secs(5)), "just now");
        assert_eq!(age(Duration::from_secs(45)), "45s ago");
        assert_eq!(age(Duration::from_secs(150)), "2m ago");
        assert_eq!(age(Duration::from_secs(7200)), "2h ago");
    }
}
