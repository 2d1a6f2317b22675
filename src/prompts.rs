//! System prompt assembly (`spec.md` §4.2 context assembly, §6 "System
//! prompt headers"): renders the YAML front-matter + `<context>` block the
//! spec pins down exactly, followed by the free-form identity/skills/inbox
//! body, through a `minijinja` template so the layout lives in one place.

use crate::config::RuntimeConfigInner;
use crate::inbox::InboxItem;
use crate::ChannelType;
use minijinja::{context, Environment};

const TEMPLATE: &str = r#"---
language: {{ language }}
---
{{ identity }}

{% if skills %}## Skills
{% for name, text in skills %}
### {{ name }}
{{ text }}
{% endfor %}
{% endif -%}
{% if inbox %}## Inbox (other conversations waiting on you)
{% for item in inbox %}
- [{{ item.channel_type }}] {{ item.summary }}
{% endfor %}
{% endif -%}
<context>
available-channels: {{ available_channels|join(", ") }}
current-session-channel: {{ current_channel }}
max-context-load-time: {{ max_context_load_minutes }}m
time-now: {{ time_now }}
</context>"#;

/// One inbox notification as surfaced to the template; kept separate from
/// [`InboxItem`] so the template only sees what it renders.
struct InboxLine {
    channel_type: String,
    summary: String,
}

impl From<&InboxItem> for InboxLine {
    fn from(item: &InboxItem) -> Self {
        Self { channel_type: item.channel_type.to_string(), summary: item.summary.clone() }
    }
}

/// Renders the full system prompt for one resolver run.
///
/// `language` defaults to `"en"` when the runtime config doesn't pin one;
/// the spec requires the front-matter key to always be present.
pub fn render_system_prompt(
    runtime: &RuntimeConfigInner,
    available_channels: &[ChannelType],
    current_channel: ChannelType,
    time_now: chrono::DateTime<chrono::Utc>,
    inbox: &[InboxItem],
) -> anyhow::Result<String> {
    let env = Environment::new();

    let skills: Vec<(String, String)> = runtime
        .skills
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let inbox_lines: Vec<InboxLine> = inbox.iter().map(InboxLine::from).collect();
    let inbox_ctx: Vec<_> = inbox_lines
        .iter()
        .map(|l| context! { channel_type => l.channel_type, summary => l.summary })
        .collect();

    let channels: Vec<String> = available_channels.iter().map(|c| c.to_string()).collect();

    let rendered = env.render_str(
        TEMPLATE,
        context! {
            language => "en",
            identity => runtime.default_identity,
            skills => skills,
            inbox => inbox_ctx,
            available_channels => channels,
            current_channel => current_channel.to_string(),
            max_context_load_minutes => runtime.max_context_load_minutes,
            time_now => time_now.to_rfc3339(),
        },
    )?;

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BotId;

    #[test]
    fn renders_required_front_matter_and_context_block() {
        let runtime = RuntimeConfigInner {
            default_identity: "You are Aria, a helpful assistant.".into(),
            ..Default::default()
        };

        let now = chrono::Utc::now();
        let prompt = render_system_prompt(
            &runtime,
            &[ChannelType::Telegram, ChannelType::Discord],
            ChannelType::Telegram,
            now,
            &[],
        )
        .unwrap();

        assert!(prompt.starts_with("---\nlanguage: en\n---"));
        assert!(prompt.contains("<context>"));
        assert!(prompt.contains("available-channels: telegram, discord"));
        assert!(prompt.contains("current-session-channel: telegram"));
        assert!(prompt.contains("You are Aria"));
    }

    #[test]
    fn renders_inbox_notifications() {
        let runtime = RuntimeConfigInner::default();
        let inbox = vec![InboxItem {
            id: uuid::Uuid::new_v4(),
            bot_id: BotId::new(),
            route_id: crate::RouteId::new(),
            channel_type: ChannelType::Discord,
            summary: "ping from #general".into(),
            consumed: false,
            created_at: chrono::Utc::now(),
        }];

        let prompt = render_system_prompt(
            &runtime,
            &[ChannelType::Discord],
            ChannelType::Discord,
            chrono::Utc::now(),
            &inbox,
        )
        .unwrap();

        assert!(prompt.contains("ping from #general"));
    }
}
