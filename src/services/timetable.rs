use crate::config::{FeedConfig, TimetableConfig};
use crate::providers::geops::{FeedError, RealtimeClient, TimetableEntry};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

const MAX_TIMETABLE_ENTRIES: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First departure inside `[now, now + lookahead]` heading to one of `destinations`.
///
/// Destinations match by substring, so "Maisach" also matches "Maisach (Bahnhof)".
pub fn pick_target_train<'a>(
    entries: &'a [TimetableEntry],
    now: DateTime<Utc>,
    destinations: &[String],
    lookahead: chrono::Duration,
) -> Option<&'a TimetableEntry> {
    let latest = now + lookahead;

    entries
        .iter()
        .filter(|entry| entry.train_number.is_some() && !entry.is_cancelled())
        .filter(|entry| {
            entry
                .departure_time()
                .is_some_and(|time| time >= now && time <= latest)
        })
        .filter(|entry| {
            let destination = entry.destination();
            destinations.iter().any(|d| destination.contains(d.as_str()))
        })
        .min_by_key(|entry| entry.time)
}

/// Decide which train to follow: the configured one, or the next matching departure.
pub async fn resolve_train_number(
    feed: &FeedConfig,
    timetable: &TimetableConfig,
) -> Result<i64, FeedError> {
    if let Some(train_number) = feed.train_number {
        info!(train_number, "Using configured train number");
        return Ok(train_number);
    }

    let mut client = RealtimeClient::connect(&feed.endpoint(), CONNECT_TIMEOUT).await?;
    let result = lookup(&mut client, timetable).await;
    client.close().await;
    result
}

async fn lookup(client: &mut RealtimeClient, config: &TimetableConfig) -> Result<i64, FeedError> {
    let uic = client
        .station_uic(&config.station_name, config.request_timeout())
        .await?;
    let entries = client
        .timetable(&uic, config.request_timeout(), MAX_TIMETABLE_ENTRIES)
        .await?;

    for entry in &entries {
        debug!(
            train_number = ?entry.train_number,
            destination = entry.destination(),
            time = ?entry.departure_time(),
            realtime = entry.has_realtime_journey,
            "Timetable entry"
        );
    }

    let picked = pick_target_train(
        &entries,
        Utc::now(),
        &config.destinations,
        chrono::Duration::minutes(config.lookahead_minutes),
    );

    match picked.and_then(|entry| entry.train_number.map(|n| (n, entry))) {
        Some((train_number, entry)) => {
            info!(
                train_number,
                destination = entry.destination(),
                departure = ?entry.departure_time(),
                station = %config.station_name,
                "Selected train to track"
            );
            Ok(train_number)
        }
        None => Err(FeedError::NoTrainFound(config.destinations.join(", "))),
    }
}
