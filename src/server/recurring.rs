//! Recurring background work: queue execution and scheduled worker reloads.

mod jobs;
mod reload;

use crate::state::AppState;

pub async fn run(state: AppState) {
    tokio::join!(jobs::run(state.clone()), reload::run(state.clone()));
}
