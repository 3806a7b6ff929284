pub mod recurring;
pub mod singleflight;
pub mod web;
pub mod workers;

use tokio::select;
use tracing::info;

use crate::{somehow, state::AppState};

pub async fn run(state: AppState) -> somehow::Result<()> {
    let supervisor = state.pool.clone().map(|pool| pool.supervise());

    let result = select! {
        e = web::run(state.clone()) => e,
        () = recurring::run(state.clone()) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    if let Some(supervisor) = supervisor {
        supervisor.abort();
    }
    state.shut_down().await;
    result
}
