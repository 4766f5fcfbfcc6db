//! Indexing: advance the cursor; clear metadata once the whole series is done.

use super::super::{DONE, MOVING};
use super::moving::loaded_loop;
use crate::metadata::MetadataMap;
use crate::sequencer::store::keys::{CONTROL, CURSOR, METADATA};
use crate::sequencer::{Action, ActionArgs, ActionResult, Cursor, Guard, State};
use tracing::debug;

/// The Indexing state.
pub fn state() -> State {
    State::new(super::super::INDEXING)
        .action(Action::sync(
            "advance_cursor",
            &[CONTROL, CURSOR, METADATA],
            advance_cursor,
        ))
        .transition_when(MOVING, Guard::field(CURSOR, Cursor::COMPLETE_FIELD, false))
        .transition_when(DONE, Guard::field(CURSOR, Cursor::COMPLETE_FIELD, true))
}

fn advance_cursor(args: ActionArgs) -> ActionResult {
    let control_loop = loaded_loop(&args)?;
    let mut cursor: Cursor = args.get_as(CURSOR)?.unwrap_or_default();
    cursor.advance(&control_loop);
    if cursor.control_loop_complete {
        args.set_as(METADATA, &MetadataMap::new())?;
    }
    debug!(
        series = cursor.series_index,
        step = cursor.sequence_index,
        complete = cursor.control_loop_complete,
        "Cursor advanced"
    );
    args.set_as(CURSOR, &cursor)
}
