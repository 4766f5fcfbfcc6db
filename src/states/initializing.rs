//! Initializing: open every instrument and publish its starting parameters.

use super::{instrument_error, read_instrument, within, TROUBLESHOOTING, WAITING};
use crate::sequencer::{Action, ActionResult, Context, State};
use std::sync::Arc;
use tracing::info;

/// The Initializing state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::INITIALIZING)
        .initial()
        .action(Action::asynchronous("open_instruments", &[], move |_| {
            let context = Arc::clone(&context);
            async move { open_instruments(&context).await }
        }))
        .transition(WAITING)
        .on_error(TROUBLESHOOTING)
}

/// Open in registration order; the first failure stops the rest.
async fn open_instruments(context: &Context) -> ActionResult {
    let limit = context.settings().machine.action_timeout();
    for (id, entry) in context.instruments().iter() {
        within(limit, &format!("{} open", id), async {
            entry.adapter.open().await.map_err(|e| instrument_error(id, e))
        })
        .await?;
        let parameters = read_instrument(id, entry.adapter.as_ref(), limit).await?;
        info!(instrument = id, parameters = parameters.len(), "Instrument ready");
        context.publisher().parameters(id, parameters);
    }
    Ok(())
}
