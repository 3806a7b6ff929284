//! Scheduled rolling reloads of the worker pool.

use std::future;

use time::{Duration, OffsetDateTime, Time};
use tracing::{error, info};

use crate::state::AppState;

/// First wall-clock occurrence of `at` strictly after `now`.
fn next_fire(now: OffsetDateTime, at: Time) -> OffsetDateTime {
    let today = now.replace_time(at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub async fn run(state: AppState) {
    let Some(pool) = state.pool.clone() else {
        return future::pending().await;
    };
    let at = match state.config.parse_reload_time() {
        Ok(at) => at,
        Err(e) => {
            // Unreachable after startup validation, but never panic the task.
            error!("Invalid reload_time: {e}");
            return future::pending().await;
        }
    };
    let period = Duration::days(state.config.reload_periodicity_days as i64);

    let mut next = next_fire(OffsetDateTime::now_utc(), at);
    loop {
        let now = OffsetDateTime::now_utc();
        if next > now {
            tokio::time::sleep((next - now).unsigned_abs()).await;
        }
        info!("Scheduled worker reload at {next}");
        pool.reload_all().await;
        next += period;
    }
}
