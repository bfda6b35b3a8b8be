pub mod api;
pub mod config;
pub mod engine;
pub mod notify;
pub mod store;
pub mod token;

/// Mercari search endpoint (v2 entity search, DPoP-authenticated)
pub const MERCARI_SEARCH_URL: &str = "https://api.mercari.jp/v2/entities:search";

/// Base URL for listing pages, item ID appended
pub const MERCARI_ITEM_BASE: &str = "https://jp.mercari.com/item/";

/// Discord REST API base URL
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
