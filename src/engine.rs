use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{MarketClient, QueryOutcome};
use crate::config::WatermarkAdvance;
use crate::notify::NotificationSink;
use crate::store::{ChannelId, EntryStore, TrackedEntry};
use crate::token::{TokenIssuer, TokenManager};

/// Why an entry was skipped for the current cycle.
///
/// Skips are contained per entry: none of them aborts the cycle or affects
/// the remaining entries.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// The marketplace refused the access token. A fresh token has already
    /// been issued for the entries that follow; this entry retries next
    /// cycle.
    #[error("marketplace rejected the access token")]
    TokenRejected,
    #[error("token issuance failed: {0:#}")]
    Issuance(anyhow::Error),
    #[error("marketplace query failed: {0:#}")]
    Query(anyhow::Error),
    /// Delivery failed after `sent` notifications already went out. In
    /// after-batch mode the watermark stays put, so those listings are
    /// re-notified next cycle.
    #[error("notification delivery failed after {sent} sent: {error:#}")]
    Delivery { sent: usize, error: anyhow::Error },
    #[error("watermark persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

/// Per-entry result of one cycle.
#[derive(Debug)]
pub enum EntryOutcome {
    /// New listings were notified and the watermark advanced.
    Dispatched { notified: usize, watermark: i64 },
    /// Query succeeded but nothing exceeded the watermark.
    NoNewListings,
    /// Entry skipped; its watermark was not advanced (except for sends
    /// already persisted in per-listing mode).
    Skipped(SkipReason),
}

/// Aggregated result of one polling cycle. Purely observational: the engine
/// never propagates an error out of `run_cycle`.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Set when the whole cycle was abandoned before processing entries
    /// (storage unreachable and reconnection failed).
    pub aborted: Option<anyhow::Error>,
    pub outcomes: Vec<(ChannelId, String, EntryOutcome)>,
}

impl CycleReport {
    fn abandoned(error: anyhow::Error) -> Self {
        Self {
            aborted: Some(error),
            ..Self::default()
        }
    }

    /// Total notifications dispatched across all entries.
    pub fn total_notified(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, _, outcome)| match outcome {
                EntryOutcome::Dispatched { notified, .. } => *notified,
                EntryOutcome::Skipped(SkipReason::Delivery { sent, .. }) => *sent,
                _ => 0,
            })
            .sum()
    }

    /// Number of entries skipped this cycle.
    pub fn total_skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, _, outcome)| matches!(outcome, EntryOutcome::Skipped(_)))
            .count()
    }
}

/// The polling engine: drives one full sweep over all tracked entries.
///
/// Owns its collaborators outright. Cycles must not overlap; the caller is
/// expected to await `run_cycle` to completion before scheduling the next
/// one, which is what keeps the shared token and connection handle race-free
/// without locks.
pub struct PollEngine<C, S, N, I>
where
    C: MarketClient,
    S: EntryStore,
    N: NotificationSink,
    I: TokenIssuer,
{
    market: C,
    store: S,
    sink: N,
    tokens: TokenManager<I>,
    watermark_advance: WatermarkAdvance,
}

impl<C, S, N, I> PollEngine<C, S, N, I>
where
    C: MarketClient,
    S: EntryStore,
    N: NotificationSink,
    I: TokenIssuer,
{
    pub fn new(
        market: C,
        store: S,
        sink: N,
        issuer: I,
        watermark_advance: WatermarkAdvance,
    ) -> Self {
        Self {
            market,
            store,
            sink,
            tokens: TokenManager::new(issuer),
            watermark_advance,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one polling cycle over all tracked entries.
    ///
    /// Verifies storage connectivity (reconnecting if needed), loads the
    /// entries, and processes each one independently. Every failure mode is
    /// contained and reported through the returned [`CycleReport`].
    pub async fn run_cycle(&mut self) -> CycleReport {
        if !self.store.verify_connection().await {
            warn!("Entry store unreachable, reconnecting...");
            if let Err(error) = self.store.reconnect().await {
                warn!("Reconnect failed, skipping cycle: {error:#}");
                return CycleReport::abandoned(error);
            }
        }

        let entries = match self.store.list_all().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Failed to load tracked entries, skipping cycle: {error:#}");
                return CycleReport::abandoned(error);
            }
        };

        let mut report = CycleReport::default();
        for entry in entries {
            let outcome = self.process_entry(&entry).await;
            match &outcome {
                EntryOutcome::Dispatched { notified, watermark } => {
                    info!(
                        "({}, \"{}\"): {notified} new listing(s), watermark now {watermark}",
                        entry.channel_id, entry.keyword,
                    );
                }
                EntryOutcome::NoNewListings => {
                    debug!("({}, \"{}\"): nothing new", entry.channel_id, entry.keyword);
                }
                EntryOutcome::Skipped(reason) => {
                    warn!(
                        "({}, \"{}\") skipped: {reason}",
                        entry.channel_id, entry.keyword,
                    );
                }
            }
            report.outcomes.push((entry.channel_id, entry.keyword, outcome));
        }
        report
    }

    /// Process a single entry: query, filter against the watermark, notify,
    /// persist the advanced watermark.
    async fn process_entry(&mut self, entry: &TrackedEntry) -> EntryOutcome {
        let token = match self.tokens.current() {
            Ok(token) => token.clone(),
            Err(error) => return EntryOutcome::Skipped(SkipReason::Issuance(error)),
        };

        let listings = match self.market.search(&entry.keyword, &token).await {
            Ok(QueryOutcome::Batch(listings)) => listings,
            Ok(QueryOutcome::Rejected) => {
                // Regenerate now so the remaining entries in this cycle
                // already use the fresh token.
                info!("Access token rejected, requesting a new one");
                if let Err(error) = self.tokens.refresh() {
                    return EntryOutcome::Skipped(SkipReason::Issuance(error));
                }
                return EntryOutcome::Skipped(SkipReason::TokenRejected);
            }
            Err(error) => return EntryOutcome::Skipped(SkipReason::Query(error)),
        };

        let mut notified = 0usize;
        let mut max_created = entry.last_seen;

        // Dispatch in batch order; only listings strictly newer than the
        // watermark count as new, so ties are never re-notified.
        for listing in &listings {
            if listing.created <= entry.last_seen {
                continue;
            }
            if let Err(error) = self
                .sink
                .send(entry.channel_id, &entry.keyword, listing)
                .await
            {
                return EntryOutcome::Skipped(SkipReason::Delivery {
                    sent: notified,
                    error,
                });
            }
            notified += 1;

            if self.watermark_advance == WatermarkAdvance::PerListing {
                if let Err(error) = self
                    .store
                    .advance_watermark(entry.channel_id, &entry.keyword, listing.created)
                    .await
                {
                    return EntryOutcome::Skipped(SkipReason::Persistence(error));
                }
                if let Err(error) = self
                    .store
                    .bump_found_count(entry.channel_id, &entry.keyword, 1)
                    .await
                {
                    warn!(
                        "({}, \"{}\"): found count update failed: {error:#}",
                        entry.channel_id, entry.keyword,
                    );
                }
            }
            max_created = max_created.max(listing.created);
        }

        if notified == 0 {
            return EntryOutcome::NoNewListings;
        }

        if self.watermark_advance == WatermarkAdvance::AfterBatch {
            if let Err(error) = self
                .store
                .advance_watermark(entry.channel_id, &entry.keyword, max_created)
                .await
            {
                return EntryOutcome::Skipped(SkipReason::Persistence(error));
            }
            if let Err(error) = self
                .store
                .bump_found_count(entry.channel_id, &entry.keyword, notified as i64)
                .await
            {
                // Watermark is already durable; the count is cosmetic.
                warn!(
                    "({}, \"{}\"): found count update failed: {error:#}",
                    entry.channel_id, entry.keyword,
                );
            }
        }

        EntryOutcome::Dispatched {
            notified,
            watermark: max_created,
        }
    }
}
