use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::Listing;
use crate::store::ChannelId;
use crate::{DISCORD_API_BASE, MERCARI_ITEM_BASE};

/// Embed accent color (Mercari orange).
const EMBED_COLOR: u32 = 0xDA5E22;

/// Request timeout for message delivery.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers one rendered listing notification to one destination channel.
#[async_trait]
pub trait NotificationSink {
    async fn send(&self, channel_id: ChannelId, keyword: &str, listing: &Listing) -> Result<()>;
}

/// Discord REST sink posting listing embeds via the create-message endpoint.
pub struct DiscordSink {
    http: reqwest::Client,
    bot_token: String,
}

impl DiscordSink {
    pub fn new(bot_token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            bot_token: bot_token.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for DiscordSink {
    async fn send(&self, channel_id: ChannelId, keyword: &str, listing: &Listing) -> Result<()> {
        let url = format!("{DISCORD_API_BASE}/channels/{channel_id}/messages");
        let payload = build_message(keyword, listing);

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("message delivery to channel {channel_id} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("channel {channel_id} delivery returned {status}");
        }
        debug!("Notified channel {channel_id} of listing {}", listing.id);
        Ok(())
    }
}

/// Build the Discord message payload for one listing.
pub fn build_message(keyword: &str, listing: &Listing) -> Value {
    let mut embed = json!({
        "title": escape_markdown(&listing.name),
        "url": format!("{MERCARI_ITEM_BASE}{}", listing.id),
        "color": EMBED_COLOR,
        "fields": [
            { "name": "Price", "value": format!("¥{}", listing.price), "inline": false },
            {
                "name": "Condition",
                "value": condition_label(listing.item_condition_id),
                "inline": false,
            },
        ],
    });
    if let Some(thumbnail) = listing.thumbnails.first() {
        embed["image"] = json!({ "url": thumbnail });
    }

    json!({
        "content": format!(
            "New search result for keyword **{}**.",
            escape_markdown(keyword)
        ),
        "embeds": [embed],
    })
}

/// Human-readable label for a Mercari item condition code.
pub fn condition_label(code: i64) -> &'static str {
    match code {
        1 => "New, unused",
        2 => "Almost new",
        3 => "No noticeable scratches or stains",
        4 => "Some scratches and stains",
        5 => "Scratched or stained",
        6 => "Poor condition",
        _ => "Unknown",
    }
}

/// Escape Discord markdown control characters in user-visible text.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '_' | '|' | '`' | '~' | '>' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Listing {
        serde_json::from_value(json!({
            "id": "m555",
            "name": "SNES *mint*",
            "price": "12000",
            "thumbnails": ["https://static.mercdn.net/thumb/m555.jpg"],
            "itemConditionId": 2,
            "created": 1_724_000_000
        }))
        .unwrap()
    }

    #[test]
    fn escapes_markdown_characters() {
        assert_eq!(escape_markdown("a*b_c"), "a\\*b\\_c");
        assert_eq!(escape_markdown("plain text"), "plain text");
        assert_eq!(escape_markdown("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn condition_labels() {
        assert_eq!(condition_label(1), "New, unused");
        assert_eq!(condition_label(6), "Poor condition");
        assert_eq!(condition_label(42), "Unknown");
    }

    #[test]
    fn message_payload_shape() {
        let payload = build_message("snes", &listing());
        assert_eq!(
            payload["content"],
            "New search result for keyword **snes**."
        );
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "SNES \\*mint\\*");
        assert_eq!(embed["url"], "https://jp.mercari.com/item/m555");
        assert_eq!(embed["fields"][0]["value"], "¥12000");
        assert_eq!(embed["fields"][1]["value"], "Almost new");
        assert_eq!(embed["image"]["url"], "https://static.mercdn.net/thumb/m555.jpg");
    }

    #[test]
    fn message_without_thumbnail_omits_image() {
        let mut item = listing();
        item.thumbnails.clear();
        let payload = build_message("snes", &item);
        assert!(payload["embeds"][0].get("image").is_none());
    }
}
